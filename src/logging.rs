//! Tracing setup shared by the `master` and `worker` subcommands.
//!
//! `DISTCARVE_LOG` (or `RUST_LOG`) sets the filter, default `info`.
//! `DISTCARVE_LOG_FORMAT=json` switches to one JSON object per line.
//! Everything goes to stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "DISTCARVE_LOG";
pub const LOG_FORMAT_ENV: &str = "DISTCARVE_LOG_FORMAT";

pub fn init_logging() {
    let filter = build_filter(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let use_json = std::env::var(LOG_FORMAT_ENV).as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn build_filter(own: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let directive = own
        .or(rust_log)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("info");
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}
