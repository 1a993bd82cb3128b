use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

use crate::aggregate::RecoveredFile;
use crate::metadata::{MetadataError, MetadataSink, RunSummary, SessionRecord};

pub struct JsonlSink {
    run_id: String,
    tool_version: String,
    config_hash: String,
    image_path: String,
    files_writer: Mutex<BufWriter<File>>,
    sessions_writer: Mutex<BufWriter<File>>,
    run_writer: Mutex<BufWriter<File>>,
}

#[derive(Serialize)]
struct Stamped<'a, T: Serialize> {
    #[serde(flatten)]
    record: &'a T,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<&'a str>,
    tool_version: &'a str,
    config_hash: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_path: Option<&'a str>,
}

impl JsonlSink {
    pub fn new(
        run_id: &str,
        tool_version: &str,
        config_hash: &str,
        image_path: &Path,
        run_output_dir: &Path,
    ) -> Result<Self, MetadataError> {
        let meta_dir = run_output_dir.join("metadata");
        std::fs::create_dir_all(&meta_dir)?;
        let open = |name: &str| -> Result<Mutex<BufWriter<File>>, MetadataError> {
            let file = File::create(meta_dir.join(name))?;
            Ok(Mutex::new(BufWriter::new(file)))
        };
        Ok(Self {
            run_id: run_id.to_string(),
            tool_version: tool_version.to_string(),
            config_hash: config_hash.to_string(),
            image_path: image_path.to_string_lossy().to_string(),
            files_writer: open("recovered_files.jsonl")?,
            sessions_writer: open("sessions.jsonl")?,
            run_writer: open("run_summary.jsonl")?,
        })
    }

    fn write_line<T: Serialize>(
        &self,
        writer: &Mutex<BufWriter<File>>,
        record: &T,
        run_id: Option<&str>,
        image_path: Option<&str>,
    ) -> Result<(), MetadataError> {
        let stamped = Stamped {
            record,
            run_id,
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
            image_path,
        };
        let mut guard = writer.lock().unwrap();
        serde_json::to_writer(&mut *guard, &stamped)?;
        guard.write_all(b"\n")?;
        Ok(())
    }
}

impl MetadataSink for JsonlSink {
    fn record_file(&self, file: &RecoveredFile) -> Result<(), MetadataError> {
        self.write_line(
            &self.files_writer,
            file,
            Some(&self.run_id),
            Some(&self.image_path),
        )
    }

    fn record_session(&self, session: &SessionRecord) -> Result<(), MetadataError> {
        self.write_line(&self.sessions_writer, session, None, Some(&self.image_path))
    }

    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError> {
        // The summary carries its own run id and image path.
        self.write_line(&self.run_writer, summary, None, None)
    }

    fn flush(&self) -> Result<(), MetadataError> {
        self.files_writer.lock().unwrap().flush()?;
        self.sessions_writer.lock().unwrap().flush()?;
        self.run_writer.lock().unwrap().flush()?;
        Ok(())
    }
}
