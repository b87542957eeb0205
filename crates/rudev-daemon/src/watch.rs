//! Inotify watch registry for device nodes.
//!
//! Watched device nodes report close-after-write, which the synthesizer
//! turns into a "change" uevent. The registry keeps the watch-descriptor
//! mapping in memory and mirrors it under `<state_dir>` (one file per
//! device id, carrying the devnode and syspath) so watches survive a
//! daemon restart.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::PathBuf;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use rudev_core::device::DeviceRecord;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, warn};

use crate::db::device_id;

/// Newtype so the inotify handle can register with the reactor.
#[derive(Debug)]
struct InotifyFd(Inotify);

impl AsRawFd for InotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// What a watched device node is known as.
#[derive(Debug, Clone)]
pub struct WatchEntry {
    /// Stable device id the state file is named after.
    pub id: String,
    /// Device node path below `/dev`.
    pub devnode: PathBuf,
    /// Absolute sysfs path of the device.
    pub syspath: PathBuf,
}

/// Registry of device-node watches.
#[derive(Debug)]
pub struct WatchRegistry {
    inotify: AsyncFd<InotifyFd>,
    by_wd: HashMap<WatchDescriptor, WatchEntry>,
    state_dir: PathBuf,
}

impl WatchRegistry {
    /// Create a registry persisting its state under `state_dir`.
    ///
    /// # Errors
    ///
    /// Fails when the inotify descriptor or the state directory cannot be
    /// created.
    pub fn new(state_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)?;
        let inotify =
            Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).map_err(io::Error::from)?;
        Ok(Self {
            inotify: AsyncFd::with_interest(InotifyFd(inotify), Interest::READABLE)?,
            by_wd: HashMap::new(),
            state_dir,
        })
    }

    /// The reactor handle, for readiness polling.
    #[must_use]
    pub fn async_fd(&self) -> &AsyncFd<impl AsRawFd> {
        &self.inotify
    }

    /// Re-register watches persisted by a previous daemon instance.
    ///
    /// Entries whose device node is gone are pruned.
    pub fn restore(&mut self) {
        let entries = match std::fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "could not read watch state directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().into_owned();
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let mut lines = content.lines();
            let (Some(devnode), Some(syspath)) = (lines.next(), lines.next()) else {
                let _ = std::fs::remove_file(entry.path());
                continue;
            };
            if let Err(err) = self.watch(WatchEntry {
                id,
                devnode: PathBuf::from(devnode),
                syspath: PathBuf::from(syspath),
            }) {
                debug!(devnode, error = %err, "dropping stale watch");
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    fn watch(&mut self, entry: WatchEntry) -> io::Result<()> {
        let wd = self
            .inotify
            .get_ref()
            .0
            .add_watch(&entry.devnode, AddWatchFlags::IN_CLOSE_WRITE)
            .map_err(io::Error::from)?;
        std::fs::write(
            self.state_dir.join(&entry.id),
            format!("{}\n{}\n", entry.devnode.display(), entry.syspath.display()),
        )?;
        debug!(devnode = %entry.devnode.display(), "watching device node");
        self.by_wd.insert(wd, entry);
        Ok(())
    }

    /// Start watching a device's node.
    ///
    /// # Errors
    ///
    /// Fails when the node cannot be watched or the state file not written.
    pub fn begin(&mut self, dev: &DeviceRecord) -> io::Result<()> {
        let Some(devnode) = &dev.devname else {
            return Ok(());
        };
        self.watch(WatchEntry {
            id: device_id(dev),
            devnode: PathBuf::from(devnode),
            syspath: PathBuf::from(dev.syspath()),
        })
    }

    /// Stop watching a device (the device is going away).
    pub fn end_device(&mut self, dev: &DeviceRecord) {
        let id = device_id(dev);
        let wd = self
            .by_wd
            .iter()
            .find(|(_, entry)| entry.id == id)
            .map(|(wd, _)| *wd);
        if let Some(wd) = wd {
            if let Err(err) = self.inotify.get_ref().0.rm_watch(wd) {
                debug!(%id, error = %err, "could not remove watch");
            }
            self.forget(wd);
        }
    }

    /// Drop a watch the kernel already removed (`IN_IGNORED`).
    pub fn forget(&mut self, wd: WatchDescriptor) {
        if let Some(entry) = self.by_wd.remove(&wd) {
            let _ = std::fs::remove_file(self.state_dir.join(&entry.id));
            debug!(devnode = %entry.devnode.display(), "watch ended");
        }
    }

    /// The entry behind a watch descriptor.
    #[must_use]
    pub fn lookup(&self, wd: WatchDescriptor) -> Option<&WatchEntry> {
        self.by_wd.get(&wd)
    }

    /// Number of active watches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_wd.len()
    }

    /// Returns `true` when nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_wd.is_empty()
    }

    /// Drain every pending inotify event.
    ///
    /// # Errors
    ///
    /// Propagates read errors other than the descriptor running dry.
    pub async fn drain(&mut self) -> io::Result<Vec<InotifyEvent>> {
        let mut out = Vec::new();
        loop {
            let mut guard = self.inotify.readable().await?;
            match self.inotify.get_ref().0.read_events() {
                Ok(events) => out.extend(events),
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready();
                    break;
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_dev(devnode: &std::path::Path) -> DeviceRecord {
        DeviceRecord::builder()
            .seqnum(1)
            .devpath("/devices/virtual/block/loop7")
            .subsystem("block")
            .devnum(7, 7)
            .devname(devnode.to_string_lossy())
            .build()
    }

    #[tokio::test]
    async fn test_close_write_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("node");
        std::fs::write(&node, b"").unwrap();

        let mut registry = WatchRegistry::new(dir.path().join("state")).unwrap();
        registry.begin(&block_dev(&node)).unwrap();
        assert_eq!(registry.len(), 1);

        // Open for write and close: IN_CLOSE_WRITE fires.
        std::fs::write(&node, b"data").unwrap();

        let events = registry.drain().await.unwrap();
        let event = events
            .iter()
            .find(|e| e.mask.contains(AddWatchFlags::IN_CLOSE_WRITE))
            .expect("close-write event");
        let entry = registry.lookup(event.wd).expect("watch entry");
        assert_eq!(entry.devnode, node);
        assert_eq!(entry.id, "b7:7");
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("node");
        std::fs::write(&node, b"").unwrap();
        let state = dir.path().join("state");

        {
            let mut registry = WatchRegistry::new(&state).unwrap();
            registry.begin(&block_dev(&node)).unwrap();
        }
        assert!(state.join("b7:7").exists());

        let mut registry = WatchRegistry::new(&state).unwrap();
        registry.restore();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_prunes_gone_devices() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("b8:0"), "/nonexistent/node\n/sys/devices/x\n").unwrap();

        let mut registry = WatchRegistry::new(&state).unwrap();
        registry.restore();
        assert!(registry.is_empty());
        assert!(!state.join("b8:0").exists());
    }

    #[tokio::test]
    async fn test_end_device_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("node");
        std::fs::write(&node, b"").unwrap();
        let state = dir.path().join("state");

        let mut registry = WatchRegistry::new(&state).unwrap();
        let dev = block_dev(&node);
        registry.begin(&dev).unwrap();
        registry.end_device(&dev);
        assert!(registry.is_empty());
        assert!(!state.join("b7:7").exists());
    }
}
