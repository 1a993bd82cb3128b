use std::path::Path;

use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::carve::SignaturePair;

#[derive(Debug, Deserialize, Clone)]
pub struct SignatureConfig {
    pub id: String,
    pub extension: String,
    pub header_hex: String,
    pub footer_hex: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub run_id: String,
    pub listen_addr: String,
    pub task_chunk_size: u64,
    pub overlap_bytes: u64,
    pub accept_timeout_secs: u64,
    pub stream_block_size: usize,
    pub scan_block_size: usize,
    pub tail_keep: usize,
    pub min_artifact_size: u64,
    pub max_artifact_size: u64,
    pub signature: SignatureConfig,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p)?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes)?;
    if config.run_id.trim().is_empty() {
        config.run_id = generate_run_id();
    }
    config.validate()?;

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig { config, config_hash })
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.task_chunk_size == 0 {
            bail!("task_chunk_size must be greater than zero");
        }
        if self.stream_block_size == 0 {
            bail!("stream_block_size must be greater than zero");
        }
        if self.scan_block_size == 0 {
            bail!("scan_block_size must be greater than zero");
        }
        if self.max_artifact_size > 0 && self.max_artifact_size < self.min_artifact_size {
            bail!(
                "max_artifact_size {} is below min_artifact_size {}",
                self.max_artifact_size,
                self.min_artifact_size
            );
        }
        self.signature_pair()?;
        Ok(())
    }

    /// Decode the configured header/footer markers.
    pub fn signature_pair(&self) -> Result<SignaturePair> {
        let header = decode_marker(&self.signature.header_hex, &self.signature.id, "header")?;
        let footer = decode_marker(&self.signature.footer_hex, &self.signature.id, "footer")?;
        Ok(SignaturePair::new(header, footer))
    }

    pub fn extension(&self) -> String {
        self.signature
            .extension
            .trim_start_matches('.')
            .to_ascii_lowercase()
    }
}

fn decode_marker(hex_str: &str, signature_id: &str, kind: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| anyhow!("invalid {kind} marker for signature {signature_id}: {e}"))?;
    if bytes.is_empty() {
        bail!("empty {kind} marker for signature {signature_id}");
    }
    Ok(bytes)
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}

fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    format!("{}_{}", now.format("%Y%m%dT%H%M%SZ"), rand_suffix())
}

fn rand_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:08x}", nanos)
}
