//! # Carving
//!
//! Signature-pair carving over a streamed chunk: [`BlockScanner`] finds
//! header..footer spans block by block, [`CarveEngine`] applies the ownership
//! window and validity checks and writes survivors to scratch files.

pub mod engine;
pub mod scanner;

use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::task::Task;

pub use engine::{CarveEngine, CarveOutcome, CarveSettings};
pub use scanner::{BlockScanner, Candidate, Step};

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug, Error)]
pub enum CarveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The one header/footer pair carved in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturePair {
    header: Vec<u8>,
    footer: Vec<u8>,
}

impl SignaturePair {
    pub fn new(header: Vec<u8>, footer: Vec<u8>) -> Self {
        Self { header, footer }
    }

    pub fn jpeg() -> Self {
        Self::new(JPEG_SOI.to_vec(), JPEG_EOI.to_vec())
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn footer(&self) -> &[u8] {
        &self.footer
    }

    /// Shortest span that can hold both markers without overlap.
    pub fn min_span(&self) -> usize {
        self.header.len() + self.footer.len()
    }

    pub fn frames(&self, bytes: &[u8]) -> bool {
        bytes.len() >= self.min_span()
            && bytes.starts_with(&self.header)
            && bytes.ends_with(&self.footer)
    }
}

impl Default for SignaturePair {
    fn default() -> Self {
        Self::jpeg()
    }
}

/// Where a chunk sits in the image and which part of it is ours to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarveWindow {
    /// Absolute image offset of the chunk's first byte.
    pub base_offset: u64,
    pub owned: Range<u64>,
}

impl CarveWindow {
    pub fn owns(&self, offset: u64) -> bool {
        self.owned.contains(&offset)
    }
}

impl From<&Task> for CarveWindow {
    fn from(task: &Task) -> Self {
        Self {
            base_offset: task.read_start,
            owned: task.start_offset..task.end_offset,
        }
    }
}

/// An artifact written to local scratch storage by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct CarvedArtifact {
    pub offset: u64,
    pub size: u64,
    pub path: PathBuf,
}

pub fn scratch_path(out_dir: &Path, offset: u64, index: usize, extension: &str) -> PathBuf {
    out_dir.join(format!("off{offset}_idx{index}.{extension}"))
}
