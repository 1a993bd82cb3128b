//! # Metadata Events
//!
//! Records flowing from worker sessions and the master to the metadata thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::Receiver;
use tracing::warn;

use crate::aggregate::RecoveredFile;
use crate::metadata::{MetadataSink, RunSummary, SessionRecord};

#[derive(Debug)]
pub enum MetadataEvent {
    /// An artifact was persisted by the aggregator
    File(RecoveredFile),
    /// A worker session ended, cleanly or not
    Session(SessionRecord),
    RunSummary(RunSummary),
}

/// Spawn the metadata recording thread. It drains `rx` until every sender is
/// dropped, then flushes the sink.
pub fn spawn_metadata_thread(
    sink: Box<dyn MetadataSink>,
    rx: Receiver<MetadataEvent>,
    error_count: Arc<AtomicU64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            let res = match &event {
                MetadataEvent::File(file) => sink.record_file(file),
                MetadataEvent::Session(session) => sink.record_session(session),
                MetadataEvent::RunSummary(summary) => sink.record_run_summary(summary),
            };
            if let Err(err) = res {
                error_count.fetch_add(1, Ordering::Relaxed);
                warn!("metadata record error: {err}");
            }
        }
        if let Err(err) = sink.flush() {
            error_count.fetch_add(1, Ordering::Relaxed);
            warn!("metadata flush error: {err}");
        }
    })
}
