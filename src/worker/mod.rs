//! # Worker Agent
//!
//! Connects to the master, pulls tasks until told to stop, carves each chunk
//! locally and streams recovered artifacts back.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::carve::{CarveEngine, CarveError, CarveSettings, CarveWindow};
use crate::constants::DEFAULT_STREAM_BLOCK;
use crate::evidence::{EvidenceError, EvidenceSource, RawFileSource};
use crate::protocol::{
    ControlMessage, TransportError, recv_bulk, recv_control, send_bulk, send_control,
};
use crate::task::Task;
use crate::util::hostname;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("carve error: {0}")]
    Carve(#[from] CarveError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("scratch file error: {0}")]
    Evidence(#[from] EvidenceError),
    #[error("unexpected {got} message while waiting for {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// `host:port` of the master.
    pub master_addr: String,
    /// Defaults to `worker_<local port>`.
    pub worker_id: Option<String>,
    pub stream_block_size: usize,
    /// Parent for per-task scratch directories; the system temp dir if unset.
    pub scratch_dir: Option<PathBuf>,
    pub carve: CarveSettings,
}

impl AgentSettings {
    pub fn new(master_addr: impl Into<String>) -> Self {
        Self {
            master_addr: master_addr.into(),
            worker_id: None,
            stream_block_size: DEFAULT_STREAM_BLOCK,
            scratch_dir: None,
            carve: CarveSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentReport {
    pub worker_id: String,
    pub tasks_completed: u64,
    pub artifacts_sent: u64,
    pub bytes_received: u64,
}

pub struct WorkerAgent {
    settings: AgentSettings,
    engine: CarveEngine,
}

impl WorkerAgent {
    pub fn new(settings: AgentSettings) -> Self {
        let engine = CarveEngine::new(settings.carve.clone());
        Self { settings, engine }
    }

    /// Connect to the master and work until it sends `stop` or hangs up.
    pub fn connect_and_run(&self) -> Result<AgentReport, AgentError> {
        let stream = TcpStream::connect(&self.settings.master_addr).map_err(|e| {
            TransportError::Connection(format!("connect {}: {e}", self.settings.master_addr))
        })?;
        let _ = stream.set_nodelay(true);
        let worker_id = match &self.settings.worker_id {
            Some(id) => id.clone(),
            None => default_worker_id(stream.local_addr()?.port()),
        };
        info!("connected to master={} as worker={}", self.settings.master_addr, worker_id);

        let reader = BufReader::new(stream.try_clone()?);
        self.run_on(reader, stream, worker_id)
    }

    /// Run the agent protocol over an already established stream.
    pub fn run_on<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
        worker_id: String,
    ) -> Result<AgentReport, AgentError> {
        let mut report = AgentReport {
            worker_id: worker_id.clone(),
            ..AgentReport::default()
        };

        send_control(
            &mut writer,
            &ControlMessage::Hello {
                worker_id: worker_id.clone(),
                hostname: Some(hostname()),
                status: Some("ready".to_string()),
            },
        )?;

        loop {
            send_control(&mut writer, &ControlMessage::RequestTask)?;
            let task = match recv_control(&mut reader)? {
                Some(ControlMessage::Stop) => {
                    info!("master sent stop worker={worker_id}");
                    break;
                }
                None => {
                    info!("master closed the connection worker={worker_id}");
                    break;
                }
                Some(msg @ ControlMessage::Task { .. }) => msg.to_task()?,
                Some(other) => {
                    return Err(AgentError::UnexpectedMessage {
                        expected: "task",
                        got: other.kind(),
                    });
                }
            };
            self.handle_task(&task, &worker_id, &mut reader, &mut writer, &mut report)?;
        }

        info!(
            "worker done worker={} tasks={} artifacts={} bytes={}",
            report.worker_id, report.tasks_completed, report.artifacts_sent, report.bytes_received
        );
        Ok(report)
    }

    fn handle_task<R: Read, W: Write>(
        &self,
        task: &Task,
        worker_id: &str,
        reader: &mut R,
        writer: &mut W,
        report: &mut AgentReport,
    ) -> Result<(), AgentError> {
        let block = self.settings.stream_block_size;
        let scratch = self.scratch_dir(worker_id, task.id)?;
        let chunk_path = scratch.path().join("chunk.bin");

        let mut chunk = BufWriter::new(File::create(&chunk_path)?);
        let received = recv_bulk(reader, &mut chunk, block)?;
        drop(chunk);
        report.bytes_received += received;
        if received != task.read_len() {
            warn!(
                "task={} expected {} chunk bytes, received {received}",
                task.id,
                task.read_len()
            );
        }
        debug!("received task={} bytes={received}", task.id);

        let outcome =
            self.engine
                .carve_file(&chunk_path, &CarveWindow::from(task), &scratch.path().join("carved"))?;
        info!(
            "carved task={} owned={}..{} candidates={} foreign={} rejected={} kept={}",
            task.id,
            task.start_offset,
            task.end_offset,
            outcome.candidates,
            outcome.foreign,
            outcome.rejected,
            outcome.artifacts.len()
        );

        send_control(
            writer,
            &ControlMessage::Result {
                task_id: Some(task.id),
                recovered_count: outcome.artifacts.len() as u64,
            },
        )?;
        for artifact in &outcome.artifacts {
            let source = RawFileSource::open(&artifact.path)?;
            send_control(
                writer,
                &ControlMessage::File {
                    offset: artifact.offset,
                    size: source.len(),
                },
            )?;
            send_bulk(writer, &source, 0, source.len(), block)?;
            report.artifacts_sent += 1;
        }

        report.tasks_completed += 1;
        Ok(())
    }

    fn scratch_dir(&self, worker_id: &str, task_id: u64) -> io::Result<tempfile::TempDir> {
        let prefix = format!("{worker_id}_t{task_id}_");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.settings.scratch_dir {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
    }
}

pub fn default_worker_id(local_port: u16) -> String {
    format!("worker_{local_port}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn jpeg_like(len: usize, fill: u8) -> Vec<u8> {
        let mut data = vec![fill; len];
        data[0..2].copy_from_slice(&[0xFF, 0xD8]);
        data[len - 2..].copy_from_slice(&[0xFF, 0xD9]);
        data
    }

    fn agent(scratch: &std::path::Path) -> WorkerAgent {
        let mut settings = AgentSettings::new("127.0.0.1:0");
        settings.stream_block_size = 128;
        settings.scratch_dir = Some(scratch.to_path_buf());
        WorkerAgent::new(settings)
    }

    fn master_script(task: &Task, chunk: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        send_control(&mut wire, &ControlMessage::task(task, 0)).expect("task");
        wire.extend_from_slice(&(chunk.len() as u64).to_be_bytes());
        wire.extend_from_slice(chunk);
        send_control(&mut wire, &ControlMessage::Stop).expect("stop");
        wire
    }

    #[test]
    fn default_id_uses_local_port() {
        assert_eq!(default_worker_id(40123), "worker_40123");
    }

    #[test]
    fn carves_task_and_reports_owned_artifacts() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut chunk = vec![0u8; 2000];
        let owned = jpeg_like(300, 1);
        chunk[200..500].copy_from_slice(&owned);
        chunk[1700..1900].copy_from_slice(&jpeg_like(200, 2));
        // Read range starts at 10_000; only [10_000, 11_500) is ours.
        let task = Task {
            id: 5,
            start_offset: 10_000,
            end_offset: 11_500,
            read_start: 10_000,
            read_end: 12_000,
        };

        let mut out = Vec::new();
        let report = agent(scratch.path())
            .run_on(
                Cursor::new(master_script(&task, &chunk)),
                &mut out,
                "worker_test".to_string(),
            )
            .expect("agent");
        assert_eq!(
            report,
            AgentReport {
                worker_id: "worker_test".to_string(),
                tasks_completed: 1,
                artifacts_sent: 1,
                bytes_received: 2000,
            }
        );

        let mut wire = Cursor::new(out);
        let hello = recv_control(&mut wire).expect("recv").expect("hello");
        assert_eq!(hello.kind(), "hello");
        assert_eq!(
            recv_control(&mut wire).expect("recv"),
            Some(ControlMessage::RequestTask)
        );
        assert_eq!(
            recv_control(&mut wire).expect("recv"),
            Some(ControlMessage::Result {
                task_id: Some(5),
                recovered_count: 1
            })
        );
        assert_eq!(
            recv_control(&mut wire).expect("recv"),
            Some(ControlMessage::File {
                offset: 10_200,
                size: 300
            })
        );
        let mut bytes = Vec::new();
        recv_bulk(&mut wire, &mut bytes, 64).expect("bulk");
        assert_eq!(bytes, owned);
        assert_eq!(
            recv_control(&mut wire).expect("recv"),
            Some(ControlMessage::RequestTask)
        );

        // Scratch directories are gone once the task is reported.
        assert_eq!(std::fs::read_dir(scratch.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn master_hangup_ends_cleanly() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let report = agent(scratch.path())
            .run_on(Cursor::new(Vec::new()), Vec::new(), "w".to_string())
            .expect("agent");
        assert_eq!(report.tasks_completed, 0);
    }

    #[test]
    fn rejects_unexpected_message() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut wire = Vec::new();
        send_control(&mut wire, &ControlMessage::RequestTask).expect("encode");
        let err = agent(scratch.path())
            .run_on(Cursor::new(wire), Vec::new(), "w".to_string())
            .expect_err("unexpected");
        assert!(matches!(
            err,
            AgentError::UnexpectedMessage {
                expected: "task",
                got: "request_task"
            }
        ));
    }

    #[test]
    fn truncated_chunk_is_incomplete_transfer() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let task = Task {
            id: 0,
            start_offset: 0,
            end_offset: 100,
            read_start: 0,
            read_end: 100,
        };
        let mut wire = Vec::new();
        send_control(&mut wire, &ControlMessage::task(&task, 0)).expect("task");
        wire.extend_from_slice(&100u64.to_be_bytes());
        wire.extend_from_slice(&[0u8; 40]);

        let err = agent(scratch.path())
            .run_on(Cursor::new(wire), Vec::new(), "w".to_string())
            .expect_err("truncated");
        assert!(matches!(
            err,
            AgentError::Transport(TransportError::IncompleteTransfer {
                expected: 100,
                received: 40
            })
        ));
    }
}
