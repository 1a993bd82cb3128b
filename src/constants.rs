use std::time::Duration;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Largest control frame either side will send or accept.
pub const MAX_CONTROL_FRAME: u32 = 1 << 20;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_STREAM_BLOCK: usize = 4 * 1024 * 1024;

/// Capacity of the channel feeding the metadata thread.
pub const METADATA_CHANNEL_CAPACITY: usize = 1024;

/// How long the accept loop sleeps between polls of a non-blocking listener.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
