//! # rudev-daemon
//!
//! The `rudevd` device-management daemon: OS wiring around the dispatch
//! engine in `rudev-core`.
//!
//! The manager process runs a single-threaded reactor that consumes kernel
//! uevents over netlink, serializes conflicting events, and fans work out
//! to a bounded pool of worker subprocesses. Workers are re-executions of
//! this same binary (the hidden `worker` subcommand); they apply rules to
//! one device at a time and acknowledge over a credentialed datagram
//! socket. Local subscribers receive the processed events back on the
//! monitor multicast group.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cgroup;
pub mod ctrl;
pub mod db;
pub mod listen;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod notify;
pub mod rules;
pub mod synth;
pub mod watch;
pub mod worker;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use rudev_core::config::ResolveNameTiming;

/// Put an inherited descriptor into nonblocking mode for the reactor.
pub(crate) fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// clap value parser for `--resolve-names`.
pub fn parse_resolve_names(value: &str) -> Result<ResolveNameTiming, String> {
    value.parse().map_err(|err| format!("{err}"))
}
