use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

use crate::aggregate::RecoveredFile;
use crate::metadata::{MetadataError, MetadataSink, RunSummary, SessionRecord};

pub struct CsvSink {
    run_id: String,
    tool_version: String,
    config_hash: String,
    image_path: String,
    files_writer: Mutex<csv::Writer<File>>,
    sessions_writer: Mutex<csv::Writer<File>>,
    run_writer: Mutex<csv::Writer<File>>,
}

#[derive(Serialize)]
struct RecoveredFileCsv<'a> {
    run_id: &'a str,
    filename: &'a str,
    path: String,
    offset: u64,
    size: u64,
    md5: &'a str,
    worker_id: &'a str,
    task_id: u64,
    tool_version: &'a str,
    config_hash: &'a str,
    image_path: &'a str,
}

#[derive(Serialize)]
struct SessionCsv<'a> {
    run_id: &'a str,
    worker_id: &'a str,
    hostname: Option<&'a str>,
    peer: &'a str,
    tasks_completed: u64,
    artifacts_reported: u64,
    files_persisted: u64,
    duplicates: u64,
    bytes_streamed: u64,
    lost_task: Option<u64>,
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct RunSummaryCsv<'a> {
    run_id: &'a str,
    image_len: u64,
    tasks_total: u64,
    tasks_completed: u64,
    lost_tasks: String,
    tasks_unserved: u64,
    workers_connected: u64,
    sessions_failed: u64,
    bytes_streamed: u64,
    artifacts_reported: u64,
    files_persisted: u64,
    duplicates: u64,
    total_bytes: u64,
    per_worker: String,
    tool_version: &'a str,
    config_hash: &'a str,
    image_path: &'a str,
}

impl CsvSink {
    pub fn new(
        run_id: &str,
        tool_version: &str,
        config_hash: &str,
        image_path: &Path,
        run_output_dir: &Path,
    ) -> Result<Self, MetadataError> {
        let meta_dir = run_output_dir.join("metadata");
        std::fs::create_dir_all(&meta_dir)?;

        let files_file = File::create(meta_dir.join("recovered_files.csv"))?;
        let sessions_file = File::create(meta_dir.join("sessions.csv"))?;
        let run_file = File::create(meta_dir.join("run_summary.csv"))?;

        let mut files_writer = csv::WriterBuilder::new().has_headers(false).from_writer(files_file);
        let mut sessions_writer = csv::WriterBuilder::new().has_headers(false).from_writer(sessions_file);
        let mut run_writer = csv::WriterBuilder::new().has_headers(false).from_writer(run_file);

        files_writer.write_record([
            "run_id",
            "filename",
            "path",
            "offset",
            "size",
            "md5",
            "worker_id",
            "task_id",
            "tool_version",
            "config_hash",
            "image_path",
        ])?;

        sessions_writer.write_record([
            "run_id",
            "worker_id",
            "hostname",
            "peer",
            "tasks_completed",
            "artifacts_reported",
            "files_persisted",
            "duplicates",
            "bytes_streamed",
            "lost_task",
            "error",
        ])?;

        run_writer.write_record([
            "run_id",
            "image_len",
            "tasks_total",
            "tasks_completed",
            "lost_tasks",
            "tasks_unserved",
            "workers_connected",
            "sessions_failed",
            "bytes_streamed",
            "artifacts_reported",
            "files_persisted",
            "duplicates",
            "total_bytes",
            "per_worker",
            "tool_version",
            "config_hash",
            "image_path",
        ])?;

        Ok(Self {
            run_id: run_id.to_string(),
            tool_version: tool_version.to_string(),
            config_hash: config_hash.to_string(),
            image_path: image_path.to_string_lossy().to_string(),
            files_writer: Mutex::new(files_writer),
            sessions_writer: Mutex::new(sessions_writer),
            run_writer: Mutex::new(run_writer),
        })
    }
}

impl MetadataSink for CsvSink {
    fn record_file(&self, file: &RecoveredFile) -> Result<(), MetadataError> {
        let record = RecoveredFileCsv {
            run_id: &self.run_id,
            filename: &file.filename,
            path: file.path.to_string_lossy().to_string(),
            offset: file.offset,
            size: file.size,
            md5: &file.hash,
            worker_id: &file.worker_id,
            task_id: file.task_id,
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
            image_path: &self.image_path,
        };
        let mut guard = self.files_writer.lock().unwrap();
        guard.serialize(record)?;
        Ok(())
    }

    fn record_session(&self, session: &SessionRecord) -> Result<(), MetadataError> {
        let record = SessionCsv {
            run_id: &session.run_id,
            worker_id: &session.worker_id,
            hostname: session.hostname.as_deref(),
            peer: &session.peer,
            tasks_completed: session.tasks_completed,
            artifacts_reported: session.artifacts_reported,
            files_persisted: session.files_persisted,
            duplicates: session.duplicates,
            bytes_streamed: session.bytes_streamed,
            lost_task: session.lost_task,
            error: session.error.as_deref(),
        };
        let mut guard = self.sessions_writer.lock().unwrap();
        guard.serialize(record)?;
        Ok(())
    }

    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError> {
        let lost_tasks = summary
            .lost_tasks
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(";");
        let per_worker = summary
            .per_worker
            .iter()
            .map(|(worker, c)| format!("{worker}={}/{}", c.files, c.bytes))
            .collect::<Vec<_>>()
            .join(";");
        let record = RunSummaryCsv {
            run_id: &summary.run_id,
            image_len: summary.image_len,
            tasks_total: summary.tasks_total,
            tasks_completed: summary.tasks_completed,
            lost_tasks,
            tasks_unserved: summary.tasks_unserved,
            workers_connected: summary.workers_connected,
            sessions_failed: summary.sessions_failed,
            bytes_streamed: summary.bytes_streamed,
            artifacts_reported: summary.artifacts_reported,
            files_persisted: summary.files_persisted,
            duplicates: summary.duplicates,
            total_bytes: summary.total_bytes,
            per_worker,
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
            image_path: &self.image_path,
        };
        let mut guard = self.run_writer.lock().unwrap();
        guard.serialize(record)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), MetadataError> {
        let mut files = self.files_writer.lock().unwrap();
        let mut sessions = self.sessions_writer.lock().unwrap();
        let mut run = self.run_writer.lock().unwrap();
        files.flush()?;
        sessions.flush()?;
        run.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::WorkerContribution;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn writes_csv_files() {
        let dir = tempdir().expect("tempdir");
        let sink = CsvSink::new("run1", "0.1.0", "hash", Path::new("/image.dd"), dir.path())
            .expect("csv sink");

        let file = RecoveredFile {
            filename: "recovered_0_0123abcd.jpg".to_string(),
            path: PathBuf::from("recovered/recovered_0_0123abcd.jpg"),
            size: 11,
            offset: 0,
            hash: "0123abcd".to_string(),
            worker_id: "worker_9".to_string(),
            task_id: 4,
        };
        sink.record_file(&file).expect("record file");
        sink.record_session(&SessionRecord {
            run_id: "run1".to_string(),
            worker_id: "worker_9".to_string(),
            lost_task: Some(5),
            error: Some("connection closed".to_string()),
            ..SessionRecord::default()
        })
        .expect("record session");

        let mut summary = RunSummary {
            run_id: "run1".to_string(),
            lost_tasks: vec![5, 7],
            files_persisted: 1,
            ..RunSummary::default()
        };
        summary.per_worker.insert(
            "worker_9".to_string(),
            WorkerContribution { files: 1, bytes: 11 },
        );
        sink.record_run_summary(&summary).expect("record summary");
        sink.flush().expect("flush");

        let meta = dir.path().join("metadata");
        let files = std::fs::read_to_string(meta.join("recovered_files.csv")).expect("read");
        assert_eq!(files.lines().count(), 2);
        assert!(files.contains("recovered_0_0123abcd.jpg"));

        let run = std::fs::read_to_string(meta.join("run_summary.csv")).expect("read");
        assert!(run.contains("5;7"));
        assert!(run.contains("worker_9=1/11"));
        assert!(meta.join("sessions.csv").exists());
    }
}
