//! rudevd - device management daemon.
//!
//! Listens to kernel uevents, serializes conflicting events, and applies
//! rules to each device in a bounded pool of worker subprocesses. See the
//! `rudev_daemon` library crate for the component breakdown.
//!
//! # Fork safety
//!
//! Daemonization via `fork()` MUST happen before the tokio runtime exists:
//! `fork()` in a multi-threaded process duplicates only the calling thread
//! and leaves any mutex held by another thread locked forever in the child.
//! `main` is therefore synchronous - it parses arguments, daemonizes, and
//! only then constructs the (current-thread) runtime and enters the
//! reactor.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rudev_core::config::StartupOptions;
use rudev_core::ResolveNameTiming;
use rudev_daemon::manager::{Manager, ManagerError, ManagerOptions};
use rudev_daemon::worker::WorkerArgs;
use rudev_daemon::{listen, logging, parse_resolve_names};
use tracing::{info, warn};

/// rudevd - manages device events.
#[derive(Parser, Debug)]
#[command(name = "rudevd")]
#[command(version, about = "Manages device events", long_about = None)]
struct Cli {
    /// Detach and run in the background.
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Enable debug output on the console.
    #[arg(short = 'D', long)]
    debug: bool,

    /// Maximum number of worker processes.
    #[arg(short = 'c', long, value_name = "INT")]
    children_max: Option<u32>,

    /// Seconds to delay the execution of helper programs.
    #[arg(short = 'e', long, value_name = "SECONDS")]
    exec_delay: Option<u64>,

    /// Seconds to wait before terminating an event.
    #[arg(short = 't', long, value_name = "SECONDS")]
    event_timeout: Option<u64>,

    /// When to resolve user and group names.
    #[arg(short = 'N', long, value_name = "early|late|never", value_parser = parse_resolve_names)]
    resolve_names: Option<ResolveNameTiming>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Internal: worker child entry point.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Worker(args)) = &cli.command {
        logging::init_worker(logging::syslog_level_filter(args.log_priority));
        return rudev_daemon::worker::run(args);
    }

    // Defaults, overridden by the kernel command line, overridden by CLI.
    let mut opts = StartupOptions::default();
    match std::fs::read_to_string("/proc/cmdline") {
        Ok(cmdline) => opts.apply_kernel_cmdline(&cmdline),
        Err(err) => warn!(error = %err, "failed to read kernel command line, ignoring"),
    }
    if cli.children_max.is_some() {
        opts.children_max = cli.children_max;
    }
    if let Some(secs) = cli.exec_delay {
        opts.exec_delay = Some(std::time::Duration::from_secs(secs));
    }
    if let Some(secs) = cli.event_timeout {
        opts.event_timeout = Some(std::time::Duration::from_secs(secs));
    }
    if cli.resolve_names.is_some() {
        opts.resolve_names = cli.resolve_names;
    }

    let log_priority = if cli.debug {
        7
    } else {
        opts.log_priority.unwrap_or(6)
    };

    // Daemonize while the process is still single-threaded.
    if cli.daemon {
        daemonize(cli.debug).context("daemonization failed")?;
    }

    let log_handle = logging::init(logging::syslog_level_filter(log_priority));

    if !nix::unistd::Uid::effective().is_root() {
        bail!("rudevd must be run as root");
    }

    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let config = Arc::new(opts.into_config(cpus, physical_memory_bytes()));
    info!(
        version = env!("CARGO_PKG_VERSION"),
        children_max = config.children_max(),
        "starting rudevd"
    );

    // Set umask before creating any file or directory.
    std::env::set_current_dir("/").context("could not change dir to /")?;
    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o022));
    let runtime_dir = PathBuf::from("/run/udev");
    std::fs::create_dir_all(&runtime_dir).context("could not create /run/udev")?;

    // A dedicated cgroup to sweep exists only when init spawned us.
    let cgroup = if nix::unistd::getppid().as_raw() == 1 {
        rudev_daemon::cgroup::current_cgroup()
    } else {
        None
    };

    let fds = listen::take_listen_fds().context("could not take over listen fds")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(async move {
        let mut manager = Manager::new(ManagerOptions {
            config,
            log_handle,
            log_priority,
            fd_ctrl: fds.ctrl,
            fd_uevent: fds.uevent,
            cgroup,
            runtime_dir,
        })
        .context("failed to allocate manager")?;

        match manager.run().await {
            Ok(()) => Ok(()),
            Err(err @ ManagerError::ExitTimeout) => Err(err).context("event loop failed"),
            Err(ManagerError::Io(err)) => Err(err).context("event loop failed"),
        }
    })
}

/// Detach from the terminal with the double-fork pattern.
///
/// Must be called before any runtime thread exists; see the module docs.
fn daemonize(debug: bool) -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    if !debug {
        redirect_stdio_to_null();
    }

    // SAFETY: called from the synchronous main before the runtime spawns
    // worker threads, so the process is still single-threaded.
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;

    // SAFETY: still single-threaded; we are the first fork's child.
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    // Shield the manager from the OOM killer; workers reset this.
    if let Err(err) = std::fs::write("/proc/self/oom_score_adj", "-1000") {
        warn!(error = %err, "failed to adjust OOM score, ignoring");
    }

    Ok(())
}

fn redirect_stdio_to_null() {
    use std::os::fd::AsRawFd;

    let Ok(null) = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
    else {
        return;
    };
    for fd in 0..=2 {
        let _ = nix::unistd::dup2(null.as_raw_fd(), fd);
    }
}

/// Physical memory of the machine, for the worker-cap default.
fn physical_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| parse_mem_total(&meminfo))
        .unwrap_or(0)
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mem_total() {
        let meminfo = "MemTotal:       16266428 kB\nMemFree:         1359028 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16_266_428 * 1024));
        assert_eq!(parse_mem_total("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn test_cli_parses_short_options() {
        let cli = Cli::parse_from(["rudevd", "-D", "-c", "4", "-t", "60", "-N", "late"]);
        assert!(cli.debug);
        assert_eq!(cli.children_max, Some(4));
        assert_eq!(cli.event_timeout, Some(60));
        assert_eq!(cli.resolve_names, Some(ResolveNameTiming::Late));
    }
}
