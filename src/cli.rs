use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::constants::DEFAULT_PORT;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackend {
    Jsonl,
    Csv,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve a disk image to workers and collect what they recover
    Master(MasterArgs),
    /// Connect to a master and carve the chunks it hands out
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
pub struct MasterArgs {
    /// Raw disk image (dd) to carve
    #[arg(short, long)]
    pub image: PathBuf,

    /// Output directory for recovered files and metadata
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Listen address (overrides config)
    #[arg(long)]
    pub listen: Option<String>,

    /// Task chunk size, in MiB (overrides config)
    #[arg(long)]
    pub task_chunk_mib: Option<u64>,

    /// Total overlap between neighbouring tasks, in KiB (overrides config)
    #[arg(long)]
    pub overlap_kib: Option<u64>,

    /// Bulk streaming block size, in MiB (overrides config)
    #[arg(long)]
    pub stream_block_mib: Option<u64>,

    /// Seconds to wait for a worker while none is connected (overrides config)
    #[arg(long)]
    pub accept_timeout_secs: Option<u64>,

    /// Metadata backend
    #[arg(long, value_enum, default_value_t = MetadataBackend::Jsonl)]
    pub metadata_backend: MetadataBackend,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Master host name or address
    pub host: String,

    /// Master port
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Bulk streaming block size, in MiB (overrides config)
    #[arg(long)]
    pub stream_block_mib: Option<u64>,

    /// Parent directory for per-task scratch space
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Worker id announced to the master (default: worker_<local port>)
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,
}

impl WorkerArgs {
    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
