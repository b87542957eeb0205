//! Worker processes.
//!
//! Workers are separate OS processes: the daemon re-executes its own binary
//! with the hidden `worker` subcommand instead of forking the running
//! reactor. Each worker inherits exactly two descriptors - its device
//! hand-off socket and the shared acknowledgment socket - so it holds no
//! references to the manager's sockets or state by construction.
//!
//! Per event, a worker takes a shared advisory lock on the device node (so
//! external tools holding the node exclusively make it skip the event),
//! applies the rules, persists the device database record, re-publishes
//! the processed device to subscribers, and sends one fixed-size ack
//! datagram. The parent authenticates acks through `SCM_CREDENTIALS`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::socket::{send, MsgFlags};
use rudev_core::config::{Config, ResolveNameTiming};
use rudev_core::control::Properties;
use rudev_core::device::DeviceRecord;
use rudev_core::engine::{Sig, WorkerControl};
use rudev_core::worker::Pid;
use tracing::{debug, warn};

use crate::db::DeviceDb;
use crate::monitor::MonitorPublisher;
use crate::rules::RulesIndex;

/// The fixed-size acknowledgment frame a worker sends per event.
pub const ACK_MESSAGE: [u8; 1] = [1];

/// Descriptor the device hand-off socket is pinned to in the child.
pub const DEVICE_FD: RawFd = 3;

/// Descriptor the acknowledgment socket is pinned to in the child.
pub const ACK_FD: RawFd = 4;

fn signal_of(sig: Sig) -> Signal {
    match sig {
        Sig::Term => Signal::SIGTERM,
        Sig::Kill => Signal::SIGKILL,
    }
}

/// Spawns worker processes and delivers devices to them.
///
/// This is the daemon-side implementation of the engine's
/// [`WorkerControl`] seam.
#[derive(Debug)]
pub struct WorkerSpawner {
    ack_tx: OwnedFd,
    channels: HashMap<Pid, UnixDatagram>,
    properties: Properties,
    config: Arc<Config>,
    log_priority: u32,
}

impl WorkerSpawner {
    /// Create a spawner.
    ///
    /// `ack_tx` is the write end of the acknowledgment socket pair, handed
    /// to every child.
    #[must_use]
    pub fn new(ack_tx: OwnedFd, config: Arc<Config>, log_priority: u32) -> Self {
        Self {
            ack_tx,
            channels: HashMap::new(),
            properties: Properties::new(),
            config,
            log_priority,
        }
    }

    /// The dynamic property table applied to future workers.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Change the log priority future workers inherit.
    pub fn set_log_priority(&mut self, priority: u32) {
        self.log_priority = priority;
    }

    /// Drop the channel of a reaped worker.
    pub fn forget(&mut self, pid: Pid) {
        self.channels.remove(&pid);
    }
}

impl WorkerControl for WorkerSpawner {
    fn spawn_worker(&mut self, dev: &DeviceRecord) -> io::Result<Pid> {
        let (parent_sock, child_sock) = UnixDatagram::pair()?;
        parent_sock.set_nonblocking(true)?;

        let mut cmd = Command::new(std::env::current_exe()?);
        cmd.arg("worker")
            .arg("--log-priority")
            .arg(self.log_priority.to_string())
            .arg("--event-timeout")
            .arg(self.config.event_timeout.as_secs().to_string())
            .arg("--exec-delay")
            .arg(self.config.exec_delay.as_secs().to_string())
            .arg("--resolve-names")
            .arg(self.config.resolve_names.to_string());

        for (key, value) in self.properties.iter() {
            match value {
                Some(value) => {
                    cmd.env(key, value);
                }
                None => {
                    cmd.env_remove(key);
                }
            }
        }

        let device_raw = child_sock.as_raw_fd();
        let ack_raw = self.ack_tx.as_raw_fd();
        unsafe {
            // dup2 drops the close-on-exec flag, so exactly these two
            // descriptors survive into the worker.
            cmd.pre_exec(move || {
                nix::unistd::dup2(device_raw, DEVICE_FD).map_err(io::Error::from)?;
                nix::unistd::dup2(ack_raw, ACK_FD).map_err(io::Error::from)?;
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        drop(child_sock);

        // Hand the first device over; the datagram waits in the socket
        // until the child enters its receive loop.
        let frame = serde_json::to_vec(dev)?;
        if let Err(err) = parent_sock.send(&frame) {
            let _ = kill(nix::unistd::Pid::from_raw(pid.as_raw()), Signal::SIGKILL);
            return Err(err);
        }

        self.channels.insert(pid, parent_sock);
        Ok(pid)
    }

    fn deliver(&mut self, pid: Pid, dev: &DeviceRecord) -> io::Result<()> {
        let channel = self
            .channels
            .get(&pid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no channel for worker"))?;
        let frame = serde_json::to_vec(dev)?;
        channel.send(&frame)?;
        Ok(())
    }

    fn kill(&mut self, pid: Pid, sig: Sig) -> io::Result<()> {
        kill(nix::unistd::Pid::from_raw(pid.as_raw()), signal_of(sig)).map_err(io::Error::from)
    }
}

/// Arguments of the hidden `worker` subcommand.
#[derive(Debug, clap::Args)]
pub struct WorkerArgs {
    /// Log priority inherited from the manager.
    #[arg(long, default_value_t = 6)]
    pub log_priority: u32,

    /// Per-event timeout in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 180)]
    pub event_timeout: u64,

    /// Delay before helper programs run, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub exec_delay: u64,

    /// When to resolve user and group names.
    #[arg(long, default_value = "early", value_parser = crate::parse_resolve_names)]
    pub resolve_names: ResolveNameTiming,
}

/// Worker child entry point.
///
/// Receives devices from the manager on the inherited hand-off socket,
/// processes them one at a time, and exits on SIGTERM or when the manager
/// goes away (`PR_SET_PDEATHSIG`).
///
/// # Errors
///
/// Returns an error (and thereby a non-zero exit) on unrecoverable setup
/// or socket failures; the manager then runs the failure fan-out.
pub fn run(args: &WorkerArgs) -> anyhow::Result<()> {
    use anyhow::Context;

    // Handed over by the spawner at fixed descriptor numbers.
    let device_sock = unsafe { UnixDatagram::from_raw_fd(DEVICE_FD) };
    let ack_tx = unsafe { OwnedFd::from_raw_fd(ACK_FD) };

    let mask = SigSet::all();
    mask.thread_block().context("failed to block signals")?;
    let mut signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .context("failed to create signalfd")?;

    // Die with the manager; ignore failure, there is no fallback.
    let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGTERM);

    // Only the manager is protected from the OOM killer.
    if let Err(err) = std::fs::write("/proc/self/oom_score_adj", "0") {
        debug!(error = %err, "failed to reset OOM score");
    }

    let rules = RulesIndex::load(args.resolve_names).context("failed to read rules")?;
    let db = DeviceDb::new("/run/udev");
    let publisher = match MonitorPublisher::open() {
        Ok(publisher) => Some(publisher),
        Err(err) => {
            warn!(error = %err, "worker cannot publish processed events");
            None
        }
    };
    let exec_delay = Duration::from_secs(args.exec_delay);

    let mut buf = vec![0u8; 128 * 1024];
    loop {
        let mut poll_fds = [
            PollFd::new(device_sock.as_fd(), PollFlags::POLLIN),
            PollFd::new(signal_fd.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => return Err(err).context("failed to poll"),
        }

        let device_ready = poll_fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let signal_ready = poll_fds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));

        if signal_ready {
            if let Ok(Some(siginfo)) = signal_fd.read_signal() {
                if siginfo.ssi_signo == Signal::SIGTERM as u32
                    || siginfo.ssi_signo == Signal::SIGINT as u32
                {
                    debug!("worker exiting on signal");
                    return Ok(());
                }
            }
        }

        if device_ready {
            let len = device_sock.recv(&mut buf)?;
            let dev: DeviceRecord = match serde_json::from_slice(&buf[..len]) {
                Ok(dev) => dev,
                Err(err) => {
                    warn!(error = %err, "dropping malformed device hand-off");
                    continue;
                }
            };

            process_event(&dev, &rules, &db, publisher.as_ref(), exec_delay);

            // Tell the manager the event slot is free again. The receiving
            // side authenticates us through SCM_CREDENTIALS.
            if let Err(err) = send(ack_tx.as_raw_fd(), &ACK_MESSAGE, MsgFlags::empty()) {
                return Err(err).context("failed to send event result to manager");
            }
        }
    }
}

fn process_event(
    dev: &DeviceRecord,
    rules: &RulesIndex,
    db: &DeviceDb,
    publisher: Option<&MonitorPublisher>,
    exec_delay: Duration,
) {
    debug!(seqnum = dev.seqnum, "event running");

    let _lock = match node_lock(dev, Path::new("/sys")) {
        NodeLock::Acquired(file) => Some(file),
        NodeLock::NotNeeded => None,
        NodeLock::Busy(devnode) => {
            // Somebody holds the node exclusively; skip rule execution for
            // this event entirely, but still acknowledge it.
            debug!(
                seqnum = dev.seqnum,
                devnode = %devnode.display(),
                "device node is locked, skipping event handling"
            );
            return;
        }
    };

    if !exec_delay.is_zero() {
        std::thread::sleep(exec_delay);
    }

    rules.apply(dev);

    if let Err(err) = db.update(dev) {
        warn!(seqnum = dev.seqnum, error = %err, "failed to update device database");
    }

    if let Some(publisher) = publisher {
        if let Err(err) = publisher.publish(dev) {
            warn!(seqnum = dev.seqnum, error = %err, "failed to publish processed event");
        }
    }

    debug!(seqnum = dev.seqnum, "event processed");
}

enum NodeLock {
    Acquired(std::fs::File),
    NotNeeded,
    Busy(PathBuf),
}

/// Take the shared advisory lock serializing device access with external
/// holders. Partitions lock their parent disk's node.
fn node_lock(dev: &DeviceRecord, sysfs_root: &Path) -> NodeLock {
    if dev.is_remove() || !shall_lock_device(dev) {
        return NodeLock::NotNeeded;
    }
    let Some(devnode) = lock_target(dev, sysfs_root) else {
        return NodeLock::NotNeeded;
    };

    use std::os::unix::fs::OpenOptionsExt;
    let Ok(file) = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK | nix::libc::O_NOFOLLOW | nix::libc::O_CLOEXEC)
        .open(&devnode)
    else {
        return NodeLock::NotNeeded;
    };
    if file.try_lock_shared().is_err() {
        return NodeLock::Busy(devnode);
    }
    NodeLock::Acquired(file)
}

/// Device-mapper, md and drbd nodes manage their own synchronization.
fn shall_lock_device(dev: &DeviceRecord) -> bool {
    dev.is_block()
        && !dev.sysname.starts_with("dm-")
        && !dev.sysname.starts_with("md")
        && !dev.sysname.starts_with("drbd")
}

/// The node to lock: the device's own node, or the whole disk's node for
/// partitions (looked up through sysfs).
fn lock_target(dev: &DeviceRecord, sysfs_root: &Path) -> Option<PathBuf> {
    if dev.devtype.as_deref() != Some("partition") {
        return dev.devname.as_ref().map(PathBuf::from);
    }

    let syspath = sysfs_root.join(dev.devpath.trim_start_matches('/'));
    let parent = syspath.parent()?;
    let uevent = std::fs::read_to_string(parent.join("uevent")).ok()?;
    let name = uevent
        .lines()
        .find_map(|line| line.strip_prefix("DEVNAME="))?;
    if name.starts_with('/') {
        Some(PathBuf::from(name))
    } else {
        Some(PathBuf::from("/dev").join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shall_lock_device() {
        let sda = DeviceRecord::builder()
            .seqnum(1)
            .devpath("/devices/host0/block/sda")
            .subsystem("block")
            .build();
        assert!(shall_lock_device(&sda));

        for name in ["dm-3", "md0", "drbd1"] {
            let dev = DeviceRecord::builder()
                .seqnum(1)
                .devpath(format!("/devices/virtual/block/{name}"))
                .subsystem("block")
                .build();
            assert!(!shall_lock_device(&dev), "{name} must not be locked");
        }

        let tty = DeviceRecord::builder()
            .seqnum(1)
            .devpath("/devices/virtual/tty/tty0")
            .subsystem("tty")
            .build();
        assert!(!shall_lock_device(&tty));
    }

    #[test]
    fn test_partition_locks_the_parent_disk() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("devices/host0/block/sda");
        std::fs::create_dir_all(disk.join("sda1")).unwrap();
        std::fs::write(disk.join("uevent"), "MAJOR=8\nMINOR=0\nDEVNAME=sda\n").unwrap();

        let part = DeviceRecord::builder()
            .seqnum(1)
            .devpath("/devices/host0/block/sda/sda1")
            .subsystem("block")
            .devtype("partition")
            .devname("/dev/sda1")
            .build();

        assert_eq!(
            lock_target(&part, dir.path()),
            Some(PathBuf::from("/dev/sda"))
        );
    }

    #[test]
    fn test_disk_locks_its_own_node() {
        let disk = DeviceRecord::builder()
            .seqnum(1)
            .devpath("/devices/host0/block/sda")
            .subsystem("block")
            .devtype("disk")
            .devname("/dev/sda")
            .build();
        assert_eq!(
            lock_target(&disk, Path::new("/sys")),
            Some(PathBuf::from("/dev/sda"))
        );
    }

    #[test]
    fn test_busy_node_skips_event() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("sdx");
        std::fs::write(&node, b"").unwrap();

        // An external holder takes the exclusive lock.
        let holder = std::fs::File::open(&node).unwrap();
        holder.try_lock_exclusive().unwrap();

        let dev = DeviceRecord::builder()
            .seqnum(1)
            .devpath("/devices/host0/block/sdx")
            .subsystem("block")
            .devtype("disk")
            .devname(node.to_string_lossy())
            .build();

        assert!(matches!(
            node_lock(&dev, dir.path()),
            NodeLock::Busy(path) if path == node
        ));
    }
}
