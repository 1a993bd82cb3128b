//! # Master
//!
//! Owns the disk image, the task queue and the aggregator. Workers connect
//! over TCP and each gets its own session thread; the master joins them all
//! and summarizes the run.

pub mod events;
pub mod session;

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::bounded;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::config::Config;
use crate::constants::{ACCEPT_POLL_INTERVAL, METADATA_CHANNEL_CAPACITY};
use crate::evidence::{self, EvidenceSource};
use crate::metadata::{self, MetadataBackendKind, RunSummary};
use crate::task::TaskQueue;

use events::{MetadataEvent, spawn_metadata_thread};
pub use session::{SessionContext, SessionError, SessionReport, WorkerSession};

#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub run_id: String,
    pub config_hash: String,
    pub image_path: PathBuf,
    /// Run directory; artifacts land in `<run_dir>/recovered`.
    pub run_dir: PathBuf,
    pub listen_addr: String,
    pub task_chunk_size: u64,
    pub overlap: u64,
    pub stream_block_size: usize,
    pub accept_timeout: Duration,
    pub extension: String,
    pub metadata_backend: Option<MetadataBackendKind>,
}

impl MasterSettings {
    pub fn from_config(cfg: &Config, config_hash: &str, image_path: &Path, run_dir: &Path) -> Self {
        Self {
            run_id: cfg.run_id.clone(),
            config_hash: config_hash.to_string(),
            image_path: image_path.to_path_buf(),
            run_dir: run_dir.to_path_buf(),
            listen_addr: cfg.listen_addr.clone(),
            task_chunk_size: cfg.task_chunk_size,
            overlap: cfg.overlap_bytes,
            stream_block_size: cfg.stream_block_size,
            accept_timeout: Duration::from_secs(cfg.accept_timeout_secs),
            extension: cfg.extension(),
            metadata_backend: Some(MetadataBackendKind::Jsonl),
        }
    }
}

pub struct Master {
    settings: MasterSettings,
    listener: TcpListener,
    image: Arc<dyn EvidenceSource>,
    queue: Arc<TaskQueue>,
    tasks_total: u64,
}

impl Master {
    /// Open the image, build the task queue and bind the listener. Port 0
    /// picks a free port; see [`Master::local_addr`].
    pub fn bind(settings: MasterSettings) -> Result<Self> {
        let image: Arc<dyn EvidenceSource> = Arc::from(
            evidence::open_image(&settings.image_path)
                .with_context(|| format!("open image {}", settings.image_path.display()))?,
        );
        let queue = TaskQueue::build(image.len(), settings.task_chunk_size, settings.overlap);
        let tasks_total = queue.len() as u64;

        let listener = TcpListener::bind(&settings.listen_addr)
            .with_context(|| format!("bind {}", settings.listen_addr))?;

        info!(
            "master ready run_id={} image={} size={} tasks={} chunk={} overlap={} listen={}",
            settings.run_id,
            settings.image_path.display(),
            image.len(),
            tasks_total,
            settings.task_chunk_size,
            settings.overlap,
            listener.local_addr()?
        );

        Ok(Self {
            settings,
            listener,
            image,
            queue: Arc::new(queue),
            tasks_total,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tasks_total(&self) -> u64 {
        self.tasks_total
    }

    /// Accept workers until the queue is drained and every session has
    /// finished, or until no session has been alive for `accept_timeout`.
    pub fn run(self) -> Result<RunSummary> {
        let recovered_dir = self.settings.run_dir.join("recovered");
        let aggregator = Arc::new(
            Aggregator::new(&recovered_dir, &self.settings.extension)
                .with_context(|| format!("create {}", recovered_dir.display()))?,
        );

        let meta_errors = Arc::new(AtomicU64::new(0));
        let (meta_tx, meta_handle) = match self.settings.metadata_backend {
            Some(backend) => {
                let sink = metadata::build_sink(
                    backend,
                    &self.settings.run_id,
                    env!("CARGO_PKG_VERSION"),
                    &self.settings.config_hash,
                    &self.settings.image_path,
                    &self.settings.run_dir,
                )?;
                let (tx, rx) = bounded(METADATA_CHANNEL_CAPACITY);
                let handle = spawn_metadata_thread(sink, rx, Arc::clone(&meta_errors));
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        let ctx = Arc::new(SessionContext {
            queue: Arc::clone(&self.queue),
            aggregator: Arc::clone(&aggregator),
            image: Arc::clone(&self.image),
            overlap: self.settings.overlap,
            stream_block_size: self.settings.stream_block_size,
            meta_tx: meta_tx.clone(),
        });

        let handles = self.accept_workers(&ctx, spawn_session)?;
        let workers_connected = handles.len() as u64;
        drop(ctx);

        let mut reports = Vec::with_capacity(handles.len());
        for (peer, handle) in handles {
            match handle.join() {
                Ok(report) => reports.push(report),
                Err(_) => {
                    warn!("session thread for peer={peer} panicked");
                    reports.push(SessionReport {
                        worker_id: peer.clone(),
                        peer,
                        error: Some("session thread panicked".to_string()),
                        ..SessionReport::default()
                    });
                }
            }
        }

        let summary = self.summarize(&reports, &aggregator, workers_connected);

        if let Some(tx) = meta_tx {
            for report in &reports {
                let _ = tx.send(MetadataEvent::Session(report.to_record(&self.settings.run_id)));
            }
            let _ = tx.send(MetadataEvent::RunSummary(summary.clone()));
        }
        if let Some(handle) = meta_handle
            && handle.join().is_err()
        {
            warn!("metadata thread panicked");
        }
        let meta_errors = meta_errors.load(Ordering::Relaxed);
        if meta_errors > 0 {
            warn!("metadata errors={meta_errors}");
        }

        if workers_connected == 0 && self.tasks_total > 0 {
            bail!(
                "no worker connected within {}s",
                self.settings.accept_timeout.as_secs()
            );
        }

        info!(
            "run finished run_id={} files={} total_bytes={} duplicates={} tasks={}/{} lost={:?} unserved={}",
            summary.run_id,
            summary.files_persisted,
            summary.total_bytes,
            summary.duplicates,
            summary.tasks_completed,
            summary.tasks_total,
            summary.lost_tasks,
            summary.tasks_unserved
        );
        for (worker, contribution) in &summary.per_worker {
            info!(
                "worker={} files={} bytes={}",
                worker, contribution.files, contribution.bytes
            );
        }
        Ok(summary)
    }

    fn accept_workers<F>(
        &self,
        ctx: &Arc<SessionContext>,
        mut spawn: F,
    ) -> Result<Vec<(String, thread::JoinHandle<SessionReport>)>>
    where
        F: FnMut(
            Arc<SessionContext>,
            TcpStream,
            String,
        ) -> io::Result<thread::JoinHandle<SessionReport>>,
    {
        self.listener.set_nonblocking(true)?;
        let mut handles: Vec<(String, thread::JoinHandle<SessionReport>)> = Vec::new();
        let mut idle_since = Instant::now();

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let peer = peer.to_string();
                    debug!("accepted connection peer={peer}");
                    match spawn(Arc::clone(ctx), stream, peer.clone()) {
                        Ok(handle) => handles.push((peer, handle)),
                        Err(err) => warn!("failed to start session for peer={peer}: {err}"),
                    }
                    idle_since = Instant::now();
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => warn!("accept failed: {err}"),
            }

            let alive = handles.iter().filter(|(_, h)| !h.is_finished()).count();
            if alive > 0 {
                idle_since = Instant::now();
            } else if self.queue.is_empty() && (!handles.is_empty() || self.tasks_total == 0) {
                debug!("queue drained and all sessions finished");
                break;
            } else if idle_since.elapsed() >= self.settings.accept_timeout {
                warn!(
                    "no live worker for {}s, {} task(s) still queued",
                    self.settings.accept_timeout.as_secs(),
                    self.queue.len()
                );
                break;
            }
            thread::sleep(ACCEPT_POLL_INTERVAL);
        }
        Ok(handles)
    }

    fn summarize(
        &self,
        reports: &[SessionReport],
        aggregator: &Aggregator,
        workers_connected: u64,
    ) -> RunSummary {
        let agg = aggregator.summary();
        let mut lost_tasks: Vec<u64> = reports.iter().filter_map(|r| r.lost_task).collect();
        lost_tasks.sort_unstable();

        RunSummary {
            run_id: self.settings.run_id.clone(),
            image_path: self.settings.image_path.to_string_lossy().to_string(),
            image_len: self.image.len(),
            tasks_total: self.tasks_total,
            tasks_completed: reports.iter().map(|r| r.completed_tasks.len() as u64).sum(),
            lost_tasks,
            tasks_unserved: self.queue.len() as u64,
            workers_connected,
            sessions_failed: reports.iter().filter(|r| r.failed()).count() as u64,
            bytes_streamed: reports.iter().map(|r| r.bytes_streamed).sum(),
            artifacts_reported: reports.iter().map(|r| r.artifacts_reported).sum(),
            files_persisted: agg.files,
            duplicates: agg.duplicates,
            total_bytes: agg.total_bytes,
            per_worker: agg.per_worker,
        }
    }
}

fn spawn_session(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    peer: String,
) -> io::Result<thread::JoinHandle<SessionReport>> {
    stream.set_nonblocking(false)?;
    let _ = stream.set_nodelay(true);
    let reader = BufReader::new(stream.try_clone()?);
    thread::Builder::new()
        .name(format!("session-{peer}"))
        .spawn(move || WorkerSession::new(ctx, reader, stream, peer).run())
}
