//! # Utility Module
//!
//! Glue between the CLI, the config file and the output directory.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::warn;

use crate::cli::{MasterArgs, MetadataBackend, WorkerArgs};
use crate::config::Config;
use crate::constants::{KIB, MIB};
use crate::metadata::MetadataBackendKind;

/// Convert CLI metadata backend to internal enum
pub fn backend_from_cli(backend: MetadataBackend) -> MetadataBackendKind {
    match backend {
        MetadataBackend::Jsonl => MetadataBackendKind::Jsonl,
        MetadataBackend::Csv => MetadataBackendKind::Csv,
    }
}

/// Fold `master` flags into the loaded config and re-validate it.
pub fn apply_master_overrides(cfg: &mut Config, args: &MasterArgs) -> Result<()> {
    if let Some(listen) = &args.listen {
        cfg.listen_addr = listen.clone();
    }
    if let Some(mib) = args.task_chunk_mib {
        cfg.task_chunk_size = mib.saturating_mul(MIB);
    }
    if let Some(kib) = args.overlap_kib {
        cfg.overlap_bytes = kib.saturating_mul(KIB);
    }
    if let Some(mib) = args.stream_block_mib {
        cfg.stream_block_size = mib_to_usize(mib)?;
    }
    if let Some(secs) = args.accept_timeout_secs {
        cfg.accept_timeout_secs = secs;
    }
    cfg.validate()
}

/// Fold `worker` flags into the loaded config and re-validate it.
pub fn apply_worker_overrides(cfg: &mut Config, args: &WorkerArgs) -> Result<()> {
    if let Some(mib) = args.stream_block_mib {
        cfg.stream_block_size = mib_to_usize(mib)?;
    }
    cfg.validate()
}

fn mib_to_usize(mib: u64) -> Result<usize> {
    usize::try_from(mib.saturating_mul(MIB)).map_err(|_| anyhow!("{mib} MiB does not fit in memory"))
}

/// Ensure output directory exists and is writable, warning on unsafe permissions.
pub fn ensure_output_dir(path: &Path) -> Result<()> {
    if path.exists() {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(anyhow!(
                "output path is not a directory: {}",
                path.display()
            ));
        }
    } else {
        std::fs::create_dir_all(path)?;
    }
    let metadata = std::fs::metadata(path)?;

    let probe_path = path.join(".distcarve_write_probe");
    match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe_path)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe_path);
        }
        Err(err) => {
            return Err(anyhow!(
                "output directory is not writable: {} ({})",
                path.display(),
                err
            ));
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            warn!("output directory is world-writable: {}", path.display());
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    Ok(())
}

/// Name of this machine as the OS reports it, `"unknown"` if unavailable.
pub fn hostname() -> String {
    system_hostname()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        warn!("gethostname failed: {}", std::io::Error::last_os_error());
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..len]).into_owned())
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    None
}
