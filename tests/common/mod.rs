//! Shared test infrastructure for cluster tests.
//!
//! Builds synthetic disk images with planted JPEG-like artifacts and runs a
//! master plus any number of workers over loopback TCP.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use distcarve::master::{Master, MasterSettings};
use distcarve::metadata::{MetadataBackendKind, RunSummary};
use distcarve::worker::{AgentError, AgentReport, AgentSettings, WorkerAgent};

pub const MIB: u64 = 1024 * 1024;

// ============================================================================
// Image Builders
// ============================================================================

pub fn insert_bytes(target: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if end > target.len() {
        target.resize(end, 0u8);
    }
    target[offset..end].copy_from_slice(data);
}

/// A JPEG-shaped blob of `size` bytes. The payload never contains 0xFF, so the
/// only markers are the leading SOI and trailing EOI. Different seeds give
/// different content.
pub fn artifact(size: usize, seed: u8) -> Vec<u8> {
    assert!(size >= 6, "artifact too small for markers");
    let mut data = Vec::with_capacity(size);
    data.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
    for i in 0..size - 6 {
        data.push(((i * 31 + seed as usize * 7 + 1) % 250) as u8);
    }
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

/// Zero-filled image of `len` bytes with each `(offset, bytes)` planted.
pub fn build_image(len: usize, planted: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let mut image = vec![0u8; len];
    for (offset, bytes) in planted {
        insert_bytes(&mut image, *offset as usize, bytes);
    }
    image
}

// ============================================================================
// Cluster Harness
// ============================================================================

pub struct Cluster {
    pub dir: tempfile::TempDir,
    pub image_path: PathBuf,
    pub settings: MasterSettings,
}

impl Cluster {
    pub fn new(image: &[u8], task_chunk_size: u64, overlap: u64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let image_path = dir.path().join("image.dd");
        fs::write(&image_path, image).expect("write image");
        let settings = MasterSettings {
            run_id: "cluster_test".to_string(),
            config_hash: String::new(),
            image_path: image_path.clone(),
            run_dir: dir.path().join("run"),
            listen_addr: "127.0.0.1:0".to_string(),
            task_chunk_size,
            overlap,
            stream_block_size: 256 * 1024,
            accept_timeout: Duration::from_secs(5),
            extension: "jpg".to_string(),
            metadata_backend: Some(MetadataBackendKind::Jsonl),
        };
        Self {
            dir,
            image_path,
            settings,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.settings.run_dir
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    pub fn bind(&self) -> Master {
        Master::bind(self.settings.clone()).expect("bind master")
    }

    /// Run the master with `workers` agents connected from the start.
    pub fn run(&self, workers: usize) -> ClusterOutcome {
        let master = self.bind();
        let addr = master.local_addr().expect("local addr").to_string();

        let agents: Vec<_> = (0..workers)
            .map(|i| {
                let settings = agent_settings(&addr, &format!("worker_{i}"), &self.scratch_dir());
                thread::spawn(move || WorkerAgent::new(settings).connect_and_run())
            })
            .collect();

        let summary = master.run().expect("master run");
        let agents = agents
            .into_iter()
            .map(|h| h.join().expect("agent thread"))
            .collect();
        ClusterOutcome { summary, agents }
    }

    pub fn recovered(&self) -> BTreeMap<u64, Vec<u8>> {
        recovered_files(self.run_dir())
    }
}

pub struct ClusterOutcome {
    pub summary: RunSummary,
    pub agents: Vec<Result<AgentReport, AgentError>>,
}

impl ClusterOutcome {
    pub fn artifacts_sent(&self) -> u64 {
        self.agents
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| r.artifacts_sent)
            .sum()
    }
}

pub fn agent_settings(addr: &str, worker_id: &str, scratch: &Path) -> AgentSettings {
    let mut settings = AgentSettings::new(addr);
    settings.worker_id = Some(worker_id.to_string());
    settings.stream_block_size = 256 * 1024;
    settings.scratch_dir = Some(scratch.to_path_buf());
    settings
}

/// Persisted artifacts keyed by the offset encoded in their file name.
pub fn recovered_files(run_dir: &Path) -> BTreeMap<u64, Vec<u8>> {
    let dir = run_dir.join("recovered");
    let mut found = BTreeMap::new();
    for entry in fs::read_dir(&dir).expect("read recovered dir") {
        let entry = entry.expect("dir entry");
        let name = entry.file_name().to_string_lossy().to_string();
        let offset = name
            .strip_prefix("recovered_")
            .and_then(|rest| rest.split('_').next())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or_else(|| panic!("unexpected file in recovered dir: {name}"));
        found.insert(offset, fs::read(entry.path()).expect("read recovered file"));
    }
    found
}

/// Lines of `metadata/recovered_files.jsonl`, one per persisted artifact.
pub fn recovered_records(run_dir: &Path) -> Vec<serde_json::Value> {
    let path = run_dir.join("metadata").join("recovered_files.jsonl");
    fs::read_to_string(&path)
        .expect("read recovered_files.jsonl")
        .lines()
        .map(|line| serde_json::from_str(line).expect("record json"))
        .collect()
}
