pub mod csv;
pub mod jsonl;

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::aggregate::{RecoveredFile, WorkerContribution};

/// One row per worker connection.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SessionRecord {
    pub run_id: String,
    pub worker_id: String,
    pub hostname: Option<String>,
    pub peer: String,
    pub tasks_completed: u64,
    pub artifacts_reported: u64,
    pub files_persisted: u64,
    pub duplicates: u64,
    pub bytes_streamed: u64,
    pub lost_task: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub image_path: String,
    pub image_len: u64,
    pub tasks_total: u64,
    pub tasks_completed: u64,
    pub lost_tasks: Vec<u64>,
    /// Tasks still queued when the master stopped accepting workers.
    pub tasks_unserved: u64,
    pub workers_connected: u64,
    pub sessions_failed: u64,
    pub bytes_streamed: u64,
    pub artifacts_reported: u64,
    pub files_persisted: u64,
    pub duplicates: u64,
    pub total_bytes: u64,
    pub per_worker: BTreeMap<String, WorkerContribution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackendKind {
    Jsonl,
    Csv,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Metadata output sink for recovered files, worker sessions and the run summary.
///
/// # Example
/// ```rust
/// use distcarve::metadata::{self, MetadataBackendKind, MetadataSink, RunSummary};
/// use std::path::Path;
///
/// let run_output_dir = std::env::temp_dir().join("distcarve_meta_example");
/// std::fs::create_dir_all(&run_output_dir).unwrap();
///
/// let sink = metadata::build_sink(
///     MetadataBackendKind::Jsonl,
///     "example_run",
///     "0.1.0",
///     "",
///     Path::new("image.dd"),
///     &run_output_dir,
/// )
/// .unwrap();
///
/// let summary = RunSummary {
///     run_id: "example_run".to_string(),
///     ..RunSummary::default()
/// };
/// sink.record_run_summary(&summary).unwrap();
/// sink.flush().unwrap();
/// ```
pub trait MetadataSink: Send + Sync {
    fn record_file(&self, file: &RecoveredFile) -> Result<(), MetadataError>;
    fn record_session(&self, session: &SessionRecord) -> Result<(), MetadataError>;
    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError>;
    fn flush(&self) -> Result<(), MetadataError>;
}

pub fn build_sink(
    backend: MetadataBackendKind,
    run_id: &str,
    tool_version: &str,
    config_hash: &str,
    image_path: &Path,
    run_output_dir: &Path,
) -> Result<Box<dyn MetadataSink>, MetadataError> {
    match backend {
        MetadataBackendKind::Jsonl => Ok(Box::new(jsonl::JsonlSink::new(
            run_id,
            tool_version,
            config_hash,
            image_path,
            run_output_dir,
        )?)),
        MetadataBackendKind::Csv => Ok(Box::new(csv::CsvSink::new(
            run_id,
            tool_version,
            config_hash,
            image_path,
            run_output_dir,
        )?)),
    }
}
