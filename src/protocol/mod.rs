//! # Wire Protocol
//!
//! Master and worker share one TCP stream carrying two kinds of frames:
//!
//! - **control**: `[u32 BE length][JSON]`, small typed messages ([`ControlMessage`])
//! - **bulk**: `[u64 BE length][raw bytes]`, disk chunks and recovered artifacts
//!
//! Neither side ever has to guess the framing: the session state machine
//! decides which frame comes next.

pub mod frame;

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evidence::EvidenceError;
use crate::task::Task;

pub use frame::{recv_bulk, recv_control, send_bulk, send_control};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("incomplete transfer: expected {expected} bytes, received {received}")]
    IncompleteTransfer { expected: u64, received: u64 },
    #[error("io error: {0}")]
    Io(io::Error),
    #[error("source error: {0}")]
    Source(#[from] EvidenceError),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportError::Connection(err.to_string()),
            _ => TransportError::Io(err),
        }
    }
}

/// Control messages exchanged on the shared stream.
///
/// Serialized as JSON objects tagged by `type`, e.g. `{"type":"request_task"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First message from a worker after connecting.
    Hello {
        worker_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    RequestTask,
    /// Followed by one bulk frame holding `[read_start, read_end)`.
    Task {
        task_id: u64,
        start_offset: u64,
        end_offset: u64,
        read_start: u64,
        read_end: u64,
        chunk_size: u64,
        #[serde(default)]
        overlap_size: u64,
    },
    /// Followed by `recovered_count` pairs of `File` + bulk frame.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<u64>,
        recovered_count: u64,
    },
    File {
        offset: u64,
        size: u64,
    },
    Stop,
}

impl ControlMessage {
    pub fn task(task: &Task, overlap_size: u64) -> Self {
        ControlMessage::Task {
            task_id: task.id,
            start_offset: task.start_offset,
            end_offset: task.end_offset,
            read_start: task.read_start,
            read_end: task.read_end,
            chunk_size: task.read_len(),
            overlap_size,
        }
    }

    /// Rebuild the task descriptor carried by a `Task` message, checking that
    /// the ranges are consistent.
    pub fn to_task(&self) -> Result<Task, TransportError> {
        let ControlMessage::Task {
            task_id,
            start_offset,
            end_offset,
            read_start,
            read_end,
            chunk_size,
            ..
        } = *self
        else {
            return Err(TransportError::Protocol(format!(
                "expected task message, got {}",
                self.kind()
            )));
        };

        if !(read_start <= start_offset && start_offset <= end_offset && end_offset <= read_end) {
            return Err(TransportError::Protocol(format!(
                "task {task_id} has inconsistent ranges: read {read_start}..{read_end}, owned {start_offset}..{end_offset}"
            )));
        }
        if chunk_size != read_end - read_start {
            return Err(TransportError::Protocol(format!(
                "task {task_id} chunk_size {chunk_size} does not match read range {}",
                read_end - read_start
            )));
        }

        Ok(Task {
            id: task_id,
            start_offset,
            end_offset,
            read_start,
            read_end,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::RequestTask => "request_task",
            ControlMessage::Task { .. } => "task",
            ControlMessage::Result { .. } => "result",
            ControlMessage::File { .. } => "file",
            ControlMessage::Stop => "stop",
        }
    }
}
