//! # Aggregator
//!
//! Concurrent sink for artifacts reported by any worker session. Content is
//! hashed with MD5 while it streams in; the first copy of each hash is
//! persisted as `recovered_<offset>_<hash8>.<ext>`, later copies are
//! discarded. One mutex covers the hash set and the record list.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Who reported an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub worker_id: String,
    pub task_id: u64,
}

impl Origin {
    pub fn new(worker_id: impl Into<String>, task_id: u64) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecoveredFile {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub offset: u64,
    pub hash: String,
    pub worker_id: String,
    pub task_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Persisted(RecoveredFile),
    Duplicate { hash: String, offset: u64 },
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WorkerContribution {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateSummary {
    pub files: u64,
    pub total_bytes: u64,
    pub duplicates: u64,
    pub per_worker: BTreeMap<String, WorkerContribution>,
}

#[derive(Default)]
struct AggregateState {
    hashes: HashSet<String>,
    records: Vec<RecoveredFile>,
    duplicates: u64,
}

pub struct Aggregator {
    dir: PathBuf,
    extension: String,
    state: Mutex<AggregateState>,
    staged_seq: AtomicU64,
}

impl Aggregator {
    pub fn new(dir: &Path, extension: &str) -> Result<Self, AggregateError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            extension: extension.to_string(),
            state: Mutex::new(AggregateState::default()),
            staged_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open a temporary file that hashes everything written to it.
    /// Hand it back through [`Aggregator::commit`] once complete.
    pub fn stage(&self, offset: u64, origin: Origin) -> Result<StagedArtifact, AggregateError> {
        let seq = self.staged_seq.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!(".staged_{seq}_{offset}.partial"));
        let file = File::create(&path)?;
        Ok(StagedArtifact {
            path,
            writer: Some(BufWriter::new(file)),
            md5: md5::Context::new(),
            written: 0,
            offset,
            origin,
            settled: false,
        })
    }

    /// Persist a staged artifact unless its content is already known.
    pub fn commit(&self, mut staged: StagedArtifact) -> Result<Admission, AggregateError> {
        if let Some(mut writer) = staged.writer.take() {
            writer.flush()?;
        }
        let hash = format!("{:x}", staged.md5.clone().compute());

        let mut state = self.state.lock().unwrap();
        if state.hashes.contains(&hash) {
            state.duplicates += 1;
            drop(state);
            staged.discard();
            debug!("discarding duplicate artifact offset={} hash={}", staged.offset, hash);
            return Ok(Admission::Duplicate {
                hash,
                offset: staged.offset,
            });
        }

        let filename = recovered_name(staged.offset, &hash, &self.extension);
        let path = self.dir.join(&filename);
        std::fs::rename(&staged.path, &path)?;
        staged.settled = true;

        let record = RecoveredFile {
            filename,
            path,
            size: staged.written,
            offset: staged.offset,
            hash: hash.clone(),
            worker_id: staged.origin.worker_id.clone(),
            task_id: staged.origin.task_id,
        };
        state.hashes.insert(hash);
        state.records.push(record.clone());
        drop(state);

        debug!(
            "persisted artifact offset={} size={} file={}",
            record.offset, record.size, record.filename
        );
        Ok(Admission::Persisted(record))
    }

    /// Hash, deduplicate and persist an artifact already held in memory.
    pub fn receive_artifact(
        &self,
        bytes: &[u8],
        offset: u64,
        origin: Origin,
    ) -> Result<Admission, AggregateError> {
        let mut staged = self.stage(offset, origin)?;
        staged.write_all(bytes)?;
        self.commit(staged)
    }

    pub fn records(&self) -> Vec<RecoveredFile> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> AggregateSummary {
        let state = self.state.lock().unwrap();
        let mut summary = AggregateSummary {
            duplicates: state.duplicates,
            ..AggregateSummary::default()
        };
        for record in &state.records {
            summary.files += 1;
            summary.total_bytes += record.size;
            let entry = summary
                .per_worker
                .entry(record.worker_id.clone())
                .or_default();
            entry.files += 1;
            entry.bytes += record.size;
        }
        summary
    }
}

pub fn recovered_name(offset: u64, hash: &str, extension: &str) -> String {
    let short = hash.get(..8).unwrap_or(hash);
    format!("recovered_{offset}_{short}.{extension}")
}

/// An artifact being received. Removed from disk on drop unless committed.
pub struct StagedArtifact {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    md5: md5::Context,
    written: u64,
    offset: u64,
    origin: Origin,
    settled: bool,
}

impl StagedArtifact {
    pub fn written(&self) -> u64 {
        self.written
    }

    fn discard(&mut self) {
        self.writer = None;
        if !self.settled {
            let _ = std::fs::remove_file(&self.path);
            self.settled = true;
        }
    }
}

impl Write for StagedArtifact {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("staged artifact already closed"))?;
        let n = writer.write(buf)?;
        self.md5.consume(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        self.discard();
    }
}
