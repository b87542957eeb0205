//! Runtime configuration.
//!
//! Configuration is assembled at startup from built-in defaults, the kernel
//! command line (`udev.*` keys) and the CLI, then frozen. The single
//! exception is the worker cap, which control clients may change at runtime,
//! so it lives in an atomic cell.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::warn;

/// Default per-event timeout.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(180);

/// Memory assumed per worker when deriving the worker-cap default.
const WORKER_MEMORY_SLICE: u64 = 128 * 1024 * 1024;

/// When user and group names in rules are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolveNameTiming {
    /// Resolve while compiling the rules database.
    #[default]
    Early,
    /// Resolve when a rule fires.
    Late,
    /// Never resolve names.
    Never,
}

impl FromStr for ResolveNameTiming {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "early" => Ok(Self::Early),
            "late" => Ok(Self::Late),
            "never" => Ok(Self::Never),
            other => Err(ConfigError::InvalidResolveNames(other.to_string())),
        }
    }
}

impl fmt::Display for ResolveNameTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Early => write!(f, "early"),
            Self::Late => write!(f, "late"),
            Self::Never => write!(f, "never"),
        }
    }
}

/// Errors from configuration parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Unrecognized `--resolve-names` value.
    #[error("invalid resolve-names value '{0}', expected early|late|never")]
    InvalidResolveNames(String),
}

/// Process-wide configuration, immutable after startup except the worker cap.
#[derive(Debug)]
pub struct Config {
    children_max: AtomicU32,
    /// Hard per-event deadline; the slow-event warning fires at a third.
    pub event_timeout: Duration,
    /// Artificial delay applied by workers before running helper programs.
    pub exec_delay: Duration,
    /// Name resolution timing for the rules database.
    pub resolve_names: ResolveNameTiming,
}

impl Config {
    /// Create a configuration with an explicit worker cap.
    #[must_use]
    pub fn new(
        children_max: u32,
        event_timeout: Duration,
        exec_delay: Duration,
        resolve_names: ResolveNameTiming,
    ) -> Self {
        Self {
            children_max: AtomicU32::new(children_max),
            event_timeout,
            exec_delay,
            resolve_names,
        }
    }

    /// The current worker cap.
    #[must_use]
    pub fn children_max(&self) -> u32 {
        self.children_max.load(Ordering::Relaxed)
    }

    /// Update the worker cap (control clients may do this at runtime).
    pub fn set_children_max(&self, value: u32) {
        self.children_max.store(value, Ordering::Relaxed);
    }

    /// Deadline for the slow-event warning.
    #[must_use]
    pub fn warn_timeout(&self) -> Duration {
        self.event_timeout / 3
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            default_children_max(1, 0),
            DEFAULT_EVENT_TIMEOUT,
            Duration::ZERO,
            ResolveNameTiming::default(),
        )
    }
}

/// Derive the default worker cap from the machine size.
///
/// `8 + 8 × cpus`, clamped so at least 10 workers are allowed and at most
/// one per 128 MiB of physical memory.
#[must_use]
pub fn default_children_max(cpus: usize, physical_memory_bytes: u64) -> u32 {
    let by_cpu = 8 + 8 * u32::try_from(cpus).unwrap_or(u32::MAX / 8);
    let by_memory = u32::try_from(physical_memory_bytes / WORKER_MEMORY_SLICE).unwrap_or(u32::MAX);
    by_cpu.min(by_memory).max(10)
}

/// Startup settings collected before the [`Config`] is frozen.
///
/// CLI flags and kernel command-line keys both write into this; the CLI is
/// applied last and wins.
#[derive(Debug, Default)]
pub struct StartupOptions {
    /// Requested log priority (syslog levels, 0-7).
    pub log_priority: Option<u32>,
    /// Requested worker cap.
    pub children_max: Option<u32>,
    /// Requested helper-program delay.
    pub exec_delay: Option<Duration>,
    /// Requested per-event timeout.
    pub event_timeout: Option<Duration>,
    /// Requested name resolution timing.
    pub resolve_names: Option<ResolveNameTiming>,
}

impl StartupOptions {
    /// Apply `udev.*` keys from the kernel command line.
    ///
    /// Recognized keys: `udev.log_priority`, `udev.children_max`,
    /// `udev.exec_delay` (seconds), `udev.event_timeout` (seconds).
    /// Unknown `udev.*` keys are logged; malformed values are warned about
    /// and ignored.
    pub fn apply_kernel_cmdline(&mut self, cmdline: &str) {
        for word in cmdline.split_ascii_whitespace() {
            let Some(rest) = word.strip_prefix("udev.") else {
                continue;
            };
            let Some((key, value)) = rest.split_once('=') else {
                warn!(option = word, "udev kernel command line option without value");
                continue;
            };
            match key {
                "log_priority" => match value.parse::<u32>() {
                    Ok(level) if level <= 7 => self.log_priority = Some(level),
                    _ => warn!(value, "failed to parse udev.log_priority, ignoring"),
                },
                "children_max" => match value.parse::<u32>() {
                    Ok(n) => self.children_max = Some(n),
                    Err(_) => warn!(value, "failed to parse udev.children_max, ignoring"),
                },
                "exec_delay" => match value.parse::<u64>() {
                    Ok(secs) => self.exec_delay = Some(Duration::from_secs(secs)),
                    Err(_) => warn!(value, "failed to parse udev.exec_delay, ignoring"),
                },
                "event_timeout" => match value.parse::<u64>() {
                    Ok(secs) => self.event_timeout = Some(Duration::from_secs(secs)),
                    Err(_) => warn!(value, "failed to parse udev.event_timeout, ignoring"),
                },
                other => warn!(
                    option = other,
                    "unknown udev kernel command line option, ignoring"
                ),
            }
        }
    }

    /// Freeze the collected options into a [`Config`].
    ///
    /// `cpus` and `physical_memory_bytes` feed the worker-cap default when
    /// no explicit cap was requested.
    #[must_use]
    pub fn into_config(self, cpus: usize, physical_memory_bytes: u64) -> Config {
        Config::new(
            self.children_max
                .unwrap_or_else(|| default_children_max(cpus, physical_memory_bytes)),
            self.event_timeout.unwrap_or(DEFAULT_EVENT_TIMEOUT),
            self.exec_delay.unwrap_or(Duration::ZERO),
            self.resolve_names.unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_children_max_scales_with_cpus() {
        let plenty = 1024 * WORKER_MEMORY_SLICE;
        assert_eq!(default_children_max(1, plenty), 16);
        assert_eq!(default_children_max(4, plenty), 40);
    }

    #[test]
    fn test_default_children_max_clamps() {
        // Tiny machine: the lower bound of 10 wins over the memory limit.
        assert_eq!(default_children_max(0, 0), 10);
        assert_eq!(default_children_max(1, 4 * WORKER_MEMORY_SLICE), 10);
        // Many cpus but little memory: memory limit wins.
        assert_eq!(default_children_max(64, 32 * WORKER_MEMORY_SLICE), 32);
    }

    #[test]
    fn test_kernel_cmdline_parsing() {
        let mut opts = StartupOptions::default();
        opts.apply_kernel_cmdline(
            "root=/dev/sda1 udev.log_priority=7 udev.children_max=4 \
             udev.exec_delay=2 udev.event_timeout=60 quiet",
        );
        assert_eq!(opts.log_priority, Some(7));
        assert_eq!(opts.children_max, Some(4));
        assert_eq!(opts.exec_delay, Some(Duration::from_secs(2)));
        assert_eq!(opts.event_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_kernel_cmdline_ignores_malformed_and_unknown() {
        let mut opts = StartupOptions::default();
        opts.apply_kernel_cmdline("udev.children_max=many udev.frobnicate=1 udev.event_timeout");
        assert_eq!(opts.children_max, None);
        assert_eq!(opts.event_timeout, None);
    }

    #[test]
    fn test_cli_overrides_win_in_into_config() {
        let mut opts = StartupOptions::default();
        opts.apply_kernel_cmdline("udev.children_max=4");
        opts.children_max = Some(2);
        let config = opts.into_config(8, u64::MAX);
        assert_eq!(config.children_max(), 2);
    }

    #[test]
    fn test_resolve_names_from_str() {
        assert_eq!(
            "late".parse::<ResolveNameTiming>().unwrap(),
            ResolveNameTiming::Late
        );
        assert!("sometimes".parse::<ResolveNameTiming>().is_err());
    }

    #[test]
    fn test_children_max_is_mutable_at_runtime() {
        let config = Config::default();
        config.set_children_max(3);
        assert_eq!(config.children_max(), 3);
    }
}
