//! Logging setup with a runtime-adjustable level.
//!
//! The subscriber filters through an `EnvFilter`, seeded from `RUST_LOG`
//! when set and from the configured syslog priority otherwise. Control
//! clients change the daemon log level at runtime (`SET_LOG_LEVEL`), so
//! the filter is installed behind a reload handle. Workers are short-lived
//! and get a plain subscriber with the level they were spawned with.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Handle used to change the daemon log level at runtime.
pub type LevelHandle = reload::Handle<EnvFilter, Registry>;

fn env_filter(fallback: LevelFilter) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback.to_string()))
}

/// Install the daemon subscriber and return the reload handle.
pub fn init(level: LevelFilter) -> LevelHandle {
    let (filter, handle) = reload::Layer::new(env_filter(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
    handle
}

/// Install a fixed-level subscriber for a worker child.
pub fn init_worker(level: LevelFilter) {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Map a syslog priority (0-7) onto a tracing level filter.
///
/// Control clients and the kernel command line speak syslog priorities.
#[must_use]
pub fn syslog_level_filter(priority: u32) -> LevelFilter {
    match priority {
        0..=3 => LevelFilter::ERROR,
        4 => LevelFilter::WARN,
        5 | 6 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

/// The filter installed when a control client sets a syslog priority.
#[must_use]
pub fn filter_for_priority(priority: u32) -> EnvFilter {
    EnvFilter::new(syslog_level_filter(priority).to_string())
}
