//! Master side of one worker connection.
//!
//! `AwaitHello -> loop { AwaitRequest -> ServeTask | Stop }`. Serving a task
//! streams its read range, then collects the worker's `result` and one
//! `file` + bulk frame pair per recovered artifact.

use std::io::{Read, Write};
use std::sync::Arc;

use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aggregate::{Admission, AggregateError, Aggregator, Origin};
use crate::evidence::EvidenceSource;
use crate::metadata::SessionRecord;
use crate::protocol::{
    ControlMessage, TransportError, recv_bulk, recv_control, send_bulk, send_control,
};
use crate::task::{Task, TaskQueue};

use super::events::MetadataEvent;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("aggregate error: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("unexpected {got} message while waiting for {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
}

/// Everything a session shares with the master and its sibling sessions.
pub struct SessionContext {
    pub queue: Arc<TaskQueue>,
    pub aggregator: Arc<Aggregator>,
    pub image: Arc<dyn EvidenceSource>,
    pub overlap: u64,
    pub stream_block_size: usize,
    pub meta_tx: Option<Sender<MetadataEvent>>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub worker_id: String,
    pub hostname: Option<String>,
    pub peer: String,
    pub completed_tasks: Vec<u64>,
    pub artifacts_reported: u64,
    pub files_persisted: u64,
    pub duplicates: u64,
    pub bytes_streamed: u64,
    /// Task that was in flight when the session failed. Never requeued.
    pub lost_task: Option<u64>,
    pub error: Option<String>,
}

impl SessionReport {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_record(&self, run_id: &str) -> SessionRecord {
        SessionRecord {
            run_id: run_id.to_string(),
            worker_id: self.worker_id.clone(),
            hostname: self.hostname.clone(),
            peer: self.peer.clone(),
            tasks_completed: self.completed_tasks.len() as u64,
            artifacts_reported: self.artifacts_reported,
            files_persisted: self.files_persisted,
            duplicates: self.duplicates,
            bytes_streamed: self.bytes_streamed,
            lost_task: self.lost_task,
            error: self.error.clone(),
        }
    }
}

pub struct WorkerSession<R, W> {
    ctx: Arc<SessionContext>,
    reader: R,
    writer: W,
    report: SessionReport,
    in_flight: Option<u64>,
}

impl<R: Read, W: Write> WorkerSession<R, W> {
    pub fn new(ctx: Arc<SessionContext>, reader: R, writer: W, peer: String) -> Self {
        Self {
            ctx,
            reader,
            writer,
            report: SessionReport {
                worker_id: peer.clone(),
                peer,
                ..SessionReport::default()
            },
            in_flight: None,
        }
    }

    /// Drive the connection to completion. Errors end only this session and
    /// are folded into the report.
    pub fn run(mut self) -> SessionReport {
        match self.drive() {
            Ok(()) => {
                info!(
                    "session done worker={} tasks={} files={} duplicates={}",
                    self.report.worker_id,
                    self.report.completed_tasks.len(),
                    self.report.files_persisted,
                    self.report.duplicates
                );
            }
            Err(err) => {
                self.report.lost_task = self.in_flight.take();
                warn!(
                    "session failed worker={} peer={} lost_task={:?}: {err}",
                    self.report.worker_id, self.report.peer, self.report.lost_task
                );
                self.report.error = Some(err.to_string());
            }
        }
        self.report
    }

    fn drive(&mut self) -> Result<(), SessionError> {
        self.await_hello()?;

        loop {
            match recv_control(&mut self.reader)? {
                None => {
                    debug!("worker={} closed the connection", self.report.worker_id);
                    return Ok(());
                }
                Some(ControlMessage::RequestTask) => {}
                Some(other) => {
                    return Err(SessionError::UnexpectedMessage {
                        expected: "request_task",
                        got: other.kind(),
                    });
                }
            }

            let Some(task) = self.ctx.queue.pop() else {
                send_control(&mut self.writer, &ControlMessage::Stop)?;
                debug!("queue drained, stopping worker={}", self.report.worker_id);
                return Ok(());
            };
            self.serve_task(task)?;
        }
    }

    fn await_hello(&mut self) -> Result<(), SessionError> {
        match recv_control(&mut self.reader)? {
            Some(ControlMessage::Hello {
                worker_id,
                hostname,
                status,
            }) => {
                info!(
                    "worker connected worker={} host={} peer={} status={}",
                    worker_id,
                    hostname.as_deref().unwrap_or("unknown"),
                    self.report.peer,
                    status.as_deref().unwrap_or("-")
                );
                self.report.worker_id = worker_id;
                self.report.hostname = hostname;
                Ok(())
            }
            Some(other) => Err(SessionError::UnexpectedMessage {
                expected: "hello",
                got: other.kind(),
            }),
            None => Err(TransportError::Connection("closed before hello".to_string()).into()),
        }
    }

    fn serve_task(&mut self, task: Task) -> Result<(), SessionError> {
        self.in_flight = Some(task.id);
        let block = self.ctx.stream_block_size;

        send_control(
            &mut self.writer,
            &ControlMessage::task(&task, self.ctx.overlap),
        )?;
        let sent = send_bulk(
            &mut self.writer,
            self.ctx.image.as_ref(),
            task.read_start,
            task.read_end,
            block,
        )?;
        self.report.bytes_streamed += sent;
        debug!(
            "streamed task={} bytes={} to worker={}",
            task.id, sent, self.report.worker_id
        );

        let recovered_count = match recv_control(&mut self.reader)? {
            Some(ControlMessage::Result {
                task_id,
                recovered_count,
            }) => {
                if let Some(id) = task_id
                    && id != task.id
                {
                    return Err(TransportError::Protocol(format!(
                        "result for task {id} while task {} is in flight",
                        task.id
                    ))
                    .into());
                }
                recovered_count
            }
            Some(other) => {
                return Err(SessionError::UnexpectedMessage {
                    expected: "result",
                    got: other.kind(),
                });
            }
            None => {
                return Err(
                    TransportError::Connection("closed before sending result".to_string()).into(),
                );
            }
        };

        let mut persisted = 0u64;
        for _ in 0..recovered_count {
            if self.receive_file(&task)? {
                persisted += 1;
            }
        }

        self.report.artifacts_reported += recovered_count;
        self.report.completed_tasks.push(task.id);
        self.in_flight = None;
        info!(
            "task done task={} worker={} owned={}..{} reported={} persisted={}",
            task.id,
            self.report.worker_id,
            task.start_offset,
            task.end_offset,
            recovered_count,
            persisted
        );
        Ok(())
    }

    /// Receive one `file` message and its bytes; returns whether it was new.
    fn receive_file(&mut self, task: &Task) -> Result<bool, SessionError> {
        let (offset, size) = match recv_control(&mut self.reader)? {
            Some(ControlMessage::File { offset, size }) => (offset, size),
            Some(other) => {
                return Err(SessionError::UnexpectedMessage {
                    expected: "file",
                    got: other.kind(),
                });
            }
            None => {
                return Err(
                    TransportError::Connection("closed before sending file".to_string()).into(),
                );
            }
        };

        let origin = Origin::new(self.report.worker_id.clone(), task.id);
        let mut staged = self.ctx.aggregator.stage(offset, origin)?;
        recv_bulk(&mut self.reader, &mut staged, self.ctx.stream_block_size)?;
        let received = staged.written();
        if received != size {
            warn!(
                "worker={} announced {size} bytes at offset={offset} but sent {received}",
                self.report.worker_id
            );
        }

        match self.ctx.aggregator.commit(staged)? {
            Admission::Persisted(record) => {
                self.report.files_persisted += 1;
                if let Some(tx) = &self.ctx.meta_tx
                    && let Err(err) = tx.send(MetadataEvent::File(record))
                {
                    warn!("metadata channel closed while sending file record: {err}");
                }
                Ok(true)
            }
            Admission::Duplicate { .. } => {
                self.report.duplicates += 1;
                Ok(false)
            }
        }
    }
}
