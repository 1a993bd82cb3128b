use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::config::Config;

use super::{
    BlockScanner, CarveError, CarveWindow, CarvedArtifact, SignaturePair, Step, scratch_path,
};

#[derive(Debug, Clone)]
pub struct CarveSettings {
    pub signature: SignaturePair,
    pub extension: String,
    pub scan_block_size: usize,
    pub tail_keep: usize,
    pub min_size: u64,
    /// 0 disables the upper bound.
    pub max_size: u64,
}

impl CarveSettings {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            signature: cfg.signature_pair()?,
            extension: cfg.extension(),
            scan_block_size: cfg.scan_block_size,
            tail_keep: cfg.tail_keep,
            min_size: cfg.min_artifact_size,
            max_size: cfg.max_artifact_size,
        })
    }
}

impl Default for CarveSettings {
    fn default() -> Self {
        Self {
            signature: SignaturePair::jpeg(),
            extension: "jpg".to_string(),
            scan_block_size: 8 * 1024 * 1024,
            tail_keep: 2 * 1024 * 1024,
            min_size: 100,
            max_size: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct CarveOutcome {
    pub artifacts: Vec<CarvedArtifact>,
    pub bytes_scanned: u64,
    /// Every header..footer span seen, before any filtering.
    pub candidates: u64,
    /// Spans starting outside the owned range.
    pub foreign: u64,
    /// Owned spans that failed the size or marker checks.
    pub rejected: u64,
}

pub struct CarveEngine {
    settings: CarveSettings,
}

impl CarveEngine {
    pub fn new(settings: CarveSettings) -> Self {
        Self { settings }
    }

    pub fn carve_file(
        &self,
        chunk_path: &Path,
        window: &CarveWindow,
        out_dir: &Path,
    ) -> Result<CarveOutcome, CarveError> {
        let file = File::open(chunk_path)?;
        self.carve_reader(file, window, out_dir)
    }

    /// Carve everything `reader` yields, treating its first byte as
    /// `window.base_offset` in the image. Kept artifacts are written to
    /// `out_dir` as they are found.
    pub fn carve_reader<R: Read>(
        &self,
        mut reader: R,
        window: &CarveWindow,
        out_dir: &Path,
    ) -> Result<CarveOutcome, CarveError> {
        std::fs::create_dir_all(out_dir)?;

        let mut scanner = BlockScanner::new(self.settings.signature.clone(), self.settings.tail_keep);
        let mut outcome = CarveOutcome::default();
        let mut block = vec![0u8; self.settings.scan_block_size.max(1)];

        loop {
            let n = fill_block(&mut reader, &mut block)?;
            if n == 0 {
                break;
            }
            scanner.push_block(&block[..n], |candidate| {
                outcome.candidates += 1;
                let offset = window.base_offset + candidate.local_offset;
                // A foreign span may hide the first owned header; only its
                // own task may consume it.
                if !window.owns(offset) {
                    outcome.foreign += 1;
                    debug!(
                        "skipping candidate outside owned range offset={} size={}",
                        offset,
                        candidate.bytes.len()
                    );
                    return Ok(Step::Skip);
                }
                if !self.is_valid(candidate.bytes) {
                    outcome.rejected += 1;
                    debug!(
                        "rejecting candidate offset={} size={}",
                        offset,
                        candidate.bytes.len()
                    );
                    return Ok(Step::Consume);
                }
                let artifact =
                    self.write_artifact(out_dir, offset, outcome.artifacts.len(), candidate.bytes)?;
                debug!("carved artifact offset={} size={}", offset, artifact.size);
                outcome.artifacts.push(artifact);
                Ok::<Step, CarveError>(Step::Consume)
            })?;
            if n < block.len() {
                break;
            }
        }

        outcome.bytes_scanned = scanner.consumed();
        Ok(outcome)
    }

    fn is_valid(&self, bytes: &[u8]) -> bool {
        let size = bytes.len() as u64;
        if size < self.settings.min_size {
            return false;
        }
        if self.settings.max_size > 0 && size > self.settings.max_size {
            return false;
        }
        self.settings.signature.frames(bytes)
    }

    fn write_artifact(
        &self,
        out_dir: &Path,
        offset: u64,
        index: usize,
        bytes: &[u8],
    ) -> Result<CarvedArtifact, CarveError> {
        let path = scratch_path(out_dir, offset, index, &self.settings.extension);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(bytes)?;
        writer.flush()?;

        Ok(CarvedArtifact {
            offset,
            size: bytes.len() as u64,
            path,
        })
    }
}

fn fill_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
