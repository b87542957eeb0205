//! Synthetic "change" events for closed device nodes.
//!
//! When a watched device node is closed after writing, userspace may have
//! changed on-disk metadata the kernel knows nothing about. Writing the
//! token `change` into a device's sysfs `uevent` file makes the kernel emit
//! a real uevent, which flows back through the normal monitor path.
//!
//! Whole disks get special treatment: if the partition table can be
//! re-read (nobody holds the device busy) the kernel emits change/remove/
//! add events on its own and nothing needs to be synthesized; otherwise a
//! "change" is synthesized for the disk and every partition.

use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

mod ioctls {
    // BLKRRPART: re-read the partition table.
    nix::ioctl_none!(blkrrpart, 0x12, 95);
}

/// Synthesizes "change" uevents through sysfs.
#[derive(Debug)]
pub struct Synthesizer;

impl Synthesizer {
    /// Create a synthesizer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Synthesize a "change" for the device behind a closed node.
    ///
    /// # Errors
    ///
    /// Propagates sysfs access failures.
    pub fn synthesize_change(&self, devnode: &Path, syspath: &Path) -> io::Result<()> {
        let info = SysfsDevice::load(syspath)?;
        if info.subsystem == "block"
            && info.devtype.as_deref() == Some("disk")
            && !info.sysname.starts_with("dm-")
        {
            synthesize_disk_change(devnode, syspath, reread_partition_table)
        } else {
            debug!(devnode = %devnode.display(), "device is closed, synthesising 'change'");
            write_change(syspath)
        }
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new()
    }
}

/// The whole-disk case, with the partition-table reread injectable.
fn synthesize_disk_change(
    devnode: &Path,
    syspath: &Path,
    reread: impl FnOnce(&Path) -> bool,
) -> io::Result<()> {
    let part_table_read = reread(devnode);
    let partitions = partitions(syspath)?;

    // The kernel already announced the change itself: a successful reread
    // emits "change" for the disk and remove/add for every partition.
    if part_table_read && !partitions.is_empty() {
        return Ok(());
    }

    debug!(devnode = %devnode.display(), "device is closed, synthesising 'change'");
    write_change(syspath)?;
    for partition in partitions {
        debug!(
            syspath = %partition.display(),
            "synthesising partition 'change'"
        );
        if let Err(err) = write_change(&partition) {
            warn!(syspath = %partition.display(), error = %err, "could not synthesise 'change'");
        }
    }
    Ok(())
}

fn write_change(syspath: &Path) -> io::Result<()> {
    std::fs::write(syspath.join("uevent"), "change\n")
}

/// Try to make the kernel re-read the partition table.
///
/// Succeeds only when nobody holds the device busy: the node is opened
/// nonblocking, locked exclusively, and `BLKRRPART` issued.
fn reread_partition_table(devnode: &Path) -> bool {
    use std::os::unix::fs::OpenOptionsExt;

    let Ok(file) = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK | nix::libc::O_NOFOLLOW | nix::libc::O_CLOEXEC)
        .open(devnode)
    else {
        return false;
    };
    if file.try_lock_exclusive().is_err() {
        return false;
    }
    unsafe { ioctls::blkrrpart(file.as_raw_fd()) }.is_ok()
}

/// Sysfs children of `syspath` that are partitions.
fn partitions(syspath: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(syspath)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(uevent) = std::fs::read_to_string(path.join("uevent")) else {
            continue;
        };
        if uevent.lines().any(|line| line == "DEVTYPE=partition") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// The sysfs attributes the synthesizer decides on.
#[derive(Debug)]
struct SysfsDevice {
    subsystem: String,
    devtype: Option<String>,
    sysname: String,
}

impl SysfsDevice {
    fn load(syspath: &Path) -> io::Result<Self> {
        let sysname = syspath
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let subsystem = std::fs::read_link(syspath.join("subsystem"))
            .ok()
            .and_then(|target| {
                target
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_default();
        let devtype = std::fs::read_to_string(syspath.join("uevent"))
            .ok()
            .and_then(|uevent| {
                uevent
                    .lines()
                    .find_map(|line| line.strip_prefix("DEVTYPE=").map(str::to_string))
            });
        Ok(Self {
            subsystem,
            devtype,
            sysname,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake sysfs: a disk with two partitions.
    fn fake_disk(root: &Path) -> PathBuf {
        let disk = root.join("sys/devices/pci0000:00/host0/block/sda");
        std::fs::create_dir_all(&disk).unwrap();
        std::fs::write(disk.join("uevent"), "MAJOR=8\nMINOR=0\nDEVTYPE=disk\n").unwrap();
        for (name, minor) in [("sda1", 1), ("sda2", 2)] {
            let part = disk.join(name);
            std::fs::create_dir_all(&part).unwrap();
            std::fs::write(
                part.join("uevent"),
                format!("MAJOR=8\nMINOR={minor}\nDEVTYPE=partition\n"),
            )
            .unwrap();
        }
        disk
    }

    #[test]
    fn test_successful_reread_synthesizes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let disk = fake_disk(dir.path());
        let node = dir.path().join("sda");
        std::fs::write(&node, b"").unwrap();

        synthesize_disk_change(&node, &disk, |_| true).unwrap();

        // No writes happened: the uevent files keep their seeded content.
        let uevent = std::fs::read_to_string(disk.join("uevent")).unwrap();
        assert!(uevent.starts_with("MAJOR=8"));
    }

    #[test]
    fn test_failed_reread_fans_out_to_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let disk = fake_disk(dir.path());
        let node = dir.path().join("sda");
        std::fs::write(&node, b"").unwrap();

        synthesize_disk_change(&node, &disk, |_| false).unwrap();

        assert_eq!(
            std::fs::read_to_string(disk.join("uevent")).unwrap(),
            "change\n"
        );
        for name in ["sda1", "sda2"] {
            assert_eq!(
                std::fs::read_to_string(disk.join(name).join("uevent")).unwrap(),
                "change\n"
            );
        }
    }

    #[test]
    fn test_reread_without_partitions_still_synthesizes() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("sys/block/sdb");
        std::fs::create_dir_all(&disk).unwrap();
        std::fs::write(disk.join("uevent"), "DEVTYPE=disk\n").unwrap();
        let node = dir.path().join("sdb");
        std::fs::write(&node, b"").unwrap();

        synthesize_disk_change(&node, &disk, |_| true).unwrap();
        assert_eq!(
            std::fs::read_to_string(disk.join("uevent")).unwrap(),
            "change\n"
        );
    }

    #[test]
    fn test_default_case_writes_change() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("sys/devices/virtual/tty/tty0");
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("uevent"), "MAJOR=4\nMINOR=0\n").unwrap();
        let node = dir.path().join("tty0");
        std::fs::write(&node, b"").unwrap();

        Synthesizer::new().synthesize_change(&node, &dev).unwrap();
        assert_eq!(
            std::fs::read_to_string(dev.join("uevent")).unwrap(),
            "change\n"
        );
    }
}
