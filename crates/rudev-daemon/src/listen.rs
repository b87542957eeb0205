//! Socket takeover from the supervisor.
//!
//! Under socket activation the supervisor hands the daemon its listening
//! sockets as inherited file descriptors, announced through `LISTEN_PID`
//! and `LISTEN_FDS`. Exactly two kinds are understood here: the SEQPACKET
//! control socket and the netlink uevent socket. Anything else is an
//! error, as is receiving the same kind twice.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    getsockname, getsockopt, sockopt, AddressFamily, SockType, SockaddrLike, SockaddrStorage,
};
use tracing::debug;

/// First inherited descriptor under the `LISTEN_FDS` protocol.
const LISTEN_FDS_START: RawFd = 3;

/// Sockets taken over from the supervisor.
#[derive(Debug, Default)]
pub struct ListenFds {
    /// The control socket, if one was passed.
    pub ctrl: Option<OwnedFd>,
    /// The uevent netlink socket, if one was passed.
    pub uevent: Option<OwnedFd>,
}

/// Collect sockets passed by the supervisor, if any.
///
/// # Errors
///
/// Fails on unexpected socket kinds or duplicates.
pub fn take_listen_fds() -> io::Result<ListenFds> {
    let mut fds = ListenFds::default();

    let Some(count) = announced_fd_count() else {
        return Ok(fds);
    };

    // Consume the announcement so it is not inherited by workers.
    std::env::remove_var("LISTEN_PID");
    std::env::remove_var("LISTEN_FDS");

    for raw in LISTEN_FDS_START..LISTEN_FDS_START + count {
        // The supervisor transferred ownership of these descriptors to us.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let addr: SockaddrStorage = getsockname(raw).map_err(io::Error::from)?;

        match addr.family() {
            Some(AddressFamily::Unix) => {
                let kind = getsockopt(&fd, sockopt::SockType).map_err(io::Error::from)?;
                if kind != SockType::SeqPacket || fds.ctrl.is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "unexpected unix socket passed by supervisor",
                    ));
                }
                debug!(fd = raw, "taking over control socket");
                fds.ctrl = Some(fd);
            }
            Some(AddressFamily::Netlink) => {
                if fds.uevent.is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "more than one netlink socket passed by supervisor",
                    ));
                }
                debug!(fd = raw, "taking over uevent socket");
                fds.uevent = Some(fd);
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unsupported socket family passed by supervisor",
                ));
            }
        }
    }

    Ok(fds)
}

fn announced_fd_count() -> Option<RawFd> {
    let pid: u32 = std::env::var("LISTEN_PID").ok()?.parse().ok()?;
    if pid != std::process::id() {
        return None;
    }
    let count: RawFd = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;
    (count > 0).then_some(count)
}
