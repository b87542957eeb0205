//! Supervisor readiness notifications.
//!
//! Implements the `sd_notify` datagram protocol: short `KEY=VALUE` states
//! sent to the socket named by `$NOTIFY_SOCKET`. Everything is best effort;
//! a daemon running without a supervisor simply has no socket to talk to.

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

/// Sends readiness and status notifications to the supervisor.
#[derive(Debug)]
pub struct Notifier {
    target: Option<(UnixDatagram, PathBuf)>,
}

impl Notifier {
    /// Create a notifier for an explicit socket path (`None` disables it).
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        let target = path.and_then(|path| {
            // Abstract-namespace sockets (leading '@') are not supported.
            if path.as_os_str().to_string_lossy().starts_with('@') {
                debug!(path = %path.display(), "abstract notify socket not supported");
                return None;
            }
            match UnixDatagram::unbound() {
                Ok(socket) => Some((socket, path)),
                Err(err) => {
                    debug!(error = %err, "could not create notify socket");
                    None
                }
            }
        });
        Self { target }
    }

    /// Create a notifier from `$NOTIFY_SOCKET`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("NOTIFY_SOCKET").map(PathBuf::from))
    }

    fn send(&self, state: &str) {
        let Some((socket, path)) = &self.target else {
            return;
        };
        if let Err(err) = socket.send_to(state.as_bytes(), path) {
            debug!(error = %err, "failed to notify supervisor");
        }
    }

    /// Announce readiness with a status line.
    pub fn ready(&self, status: &str) {
        self.send(&format!("READY=1\nSTATUS={status}"));
    }

    /// Announce an in-progress reload.
    pub fn reloading(&self, status: &str) {
        self.send(&format!("RELOADING=1\nSTATUS={status}"));
    }

    /// Announce that shutdown has begun.
    pub fn stopping(&self, status: &str) {
        self.send(&format!("STOPPING=1\nSTATUS={status}"));
    }

    /// Pet the supervisor watchdog.
    pub fn watchdog(&self) {
        self.send("WATCHDOG=1");
    }

    /// The interval at which the watchdog wants to be petted, from
    /// `$WATCHDOG_USEC`, halved for safety margin.
    #[must_use]
    pub fn watchdog_interval() -> Option<Duration> {
        let usec: u64 = std::env::var("WATCHDOG_USEC").ok()?.parse().ok()?;
        if usec == 0 {
            return None;
        }
        Some(Duration::from_micros(usec / 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_reach_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        let notifier = Notifier::new(Some(path));
        notifier.ready("Processing with 16 children at max");
        notifier.stopping("Starting shutdown...");

        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(
            &buf[..n],
            b"READY=1\nSTATUS=Processing with 16 children at max"
        );
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STOPPING=1\nSTATUS=Starting shutdown...");
    }

    #[test]
    fn test_disabled_notifier_is_silent() {
        let notifier = Notifier::new(None);
        notifier.ready("no-op");
        notifier.watchdog();
    }
}
