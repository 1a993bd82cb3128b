pub mod aggregate;
pub mod carve;
pub mod cli;
pub mod config;
pub mod constants;
pub mod evidence;
pub mod logging;
pub mod master;
pub mod metadata;
pub mod protocol;
pub mod task;
pub mod util;
pub mod worker;
