//! Control socket listener.
//!
//! Local administration tools talk to the daemon over a SEQPACKET Unix
//! socket: one connection, one JSON-encoded sequence of [`ControlOp`]s.
//! The listener runs at the lowest reactor priority so a ping reply is
//! only observed after all pending device traffic of the same iteration
//! has been absorbed into the queue. The EXIT acknowledgment is the
//! connection itself, held open by the manager until the daemon goes down.

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept4, bind, listen, recv, socket, AddressFamily, Backlog, MsgFlags, SockFlag, SockType,
    UnixAddr,
};
use rudev_core::control::ControlOp;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

/// Default control socket path.
pub const CONTROL_SOCKET: &str = "/run/udev/control";

/// How long to wait for the request datagram after accepting a connection.
const RECEIVE_TIMEOUT_MS: u16 = 3000;

/// Listening side of the control socket.
#[derive(Debug)]
pub struct CtrlListener {
    fd: AsyncFd<OwnedFd>,
}

impl CtrlListener {
    /// Bind a fresh control socket at `path`, replacing a stale one.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be created, bound or listened on.
    pub fn bind(path: &Path) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(io::Error::from)?;
        let addr = UnixAddr::new(path).map_err(io::Error::from)?;
        bind(fd.as_raw_fd(), &addr).map_err(io::Error::from)?;
        listen(&fd, Backlog::new(4).map_err(io::Error::from)?).map_err(io::Error::from)?;

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        Self::wrap(fd)
    }

    /// Take over a pre-opened listening socket from the supervisor.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor cannot be registered with the reactor.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        crate::set_nonblocking(&fd)?;
        Self::wrap(fd)
    }

    fn wrap(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE)?,
        })
    }

    /// The reactor handle, for readiness polling.
    #[must_use]
    pub fn async_fd(&self) -> &AsyncFd<OwnedFd> {
        &self.fd
    }

    /// Accept one pending connection, or `None` when nothing is queued.
    ///
    /// # Errors
    ///
    /// Propagates accept failures other than the listener running dry.
    pub async fn accept(&self) -> io::Result<Option<CtrlConnection>> {
        loop {
            let mut guard = self.fd.readable().await?;
            match accept4(
                self.fd.get_ref().as_raw_fd(),
                SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(raw) => {
                    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                    return Ok(Some(CtrlConnection { fd }));
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready();
                    return Ok(None);
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// One accepted control connection.
#[derive(Debug)]
pub struct CtrlConnection {
    fd: OwnedFd,
}

impl CtrlConnection {
    /// Receive the request carried by this connection.
    ///
    /// The client sends its datagram right after connecting; a short poll
    /// guards against clients that connect and stall.
    ///
    /// # Errors
    ///
    /// Fails on timeouts, receive errors and malformed payloads.
    pub fn receive(&self) -> io::Result<Vec<ControlOp>> {
        let mut poll_fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut poll_fds, PollTimeout::from(RECEIVE_TIMEOUT_MS))
            .map_err(io::Error::from)?;
        if ready == 0 {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "control client sent no request",
            ));
        }

        let mut buf = [0u8; 8192];
        let len = recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty())
            .map_err(io::Error::from)?;
        let ops: Vec<ControlOp> = serde_json::from_slice(&buf[..len])?;
        debug!(ops = ops.len(), "control request received");
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{connect, send};

    /// Connect, send the request and return the live client socket; the
    /// caller keeps it so the connection stays open while the server reads.
    fn client_send(path: &Path, ops: &[ControlOp]) -> OwnedFd {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .unwrap();
        let addr = UnixAddr::new(path).unwrap();
        connect(fd.as_raw_fd(), &addr).unwrap();
        let payload = serde_json::to_vec(ops).unwrap();
        send(fd.as_raw_fd(), &payload, MsgFlags::empty()).unwrap();
        fd
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let listener = CtrlListener::bind(&path).unwrap();

        let ops = vec![
            ControlOp::SetEnv("FOO=bar".to_string()),
            ControlOp::SetChildrenMax(4),
        ];
        let _client = client_send(&path, &ops);

        let conn = listener.accept().await.unwrap().expect("connection");
        assert_eq!(conn.receive().unwrap(), ops);
    }

    #[tokio::test]
    async fn test_accept_with_empty_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let listener = CtrlListener::bind(&path).unwrap();

        // Nothing queued: accept drains to None without blocking forever.
        let _client = client_send(&path, &[ControlOp::Ping]);
        let first = listener.accept().await.unwrap();
        assert!(first.is_some());
        let second = listener.accept().await.unwrap();
        assert!(second.is_none());
    }
}
