//! Per-device database and tag index.
//!
//! Workers persist one record per device under `<root>/data/<id>` after a
//! successful run; tags from the `TAGS` property are mirrored as empty
//! files under `<root>/tags/<tag>/<id>`. When a worker dies holding an
//! event, the failure path deletes the record and clears the device from
//! the index so stale state never outlives the device.

use std::io;
use std::path::PathBuf;

use rudev_core::device::DeviceRecord;
use tracing::debug;

/// Stable on-disk identifier for a device.
///
/// Block and character devices use their device numbers (`b8:1`, `c4:64`),
/// network interfaces their ifindex (`n3`), everything else the
/// subsystem/sysname pair (`+usb:1-1.2`).
#[must_use]
pub fn device_id(dev: &DeviceRecord) -> String {
    if !dev.devnum.is_absent() {
        let kind = if dev.is_block() { 'b' } else { 'c' };
        format!("{kind}{}", dev.devnum)
    } else if dev.ifindex > 0 {
        format!("n{}", dev.ifindex)
    } else {
        format!("+{}:{}", dev.subsystem, dev.sysname)
    }
}

/// The on-disk device database.
#[derive(Debug, Clone)]
pub struct DeviceDb {
    root: PathBuf,
}

impl DeviceDb {
    /// Database rooted at an explicit directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn data_path(&self, id: &str) -> PathBuf {
        self.root.join("data").join(id)
    }

    fn tags_dir(&self) -> PathBuf {
        self.root.join("tags")
    }

    /// Persist the device record and its tag-index entries.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors; callers treat them as warnings.
    pub fn update(&self, dev: &DeviceRecord) -> io::Result<()> {
        let id = device_id(dev);
        std::fs::create_dir_all(self.root.join("data"))?;
        std::fs::write(self.data_path(&id), serde_json::to_vec(&dev.properties)?)?;

        for tag in tags_of(dev) {
            let dir = self.tags_dir().join(tag);
            std::fs::create_dir_all(&dir)?;
            std::fs::File::create(dir.join(&id))?;
        }
        debug!(%id, "device database updated");
        Ok(())
    }

    /// Delete the device record and drop the device from the tag index.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors other than the entry already missing.
    pub fn delete(&self, dev: &DeviceRecord) -> io::Result<()> {
        let id = device_id(dev);
        match std::fs::remove_file(self.data_path(&id)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        // The record is gone; sweep the id out of every tag directory.
        let tags = match std::fs::read_dir(self.tags_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        for entry in tags {
            let entry = entry?;
            match std::fs::remove_file(entry.path().join(&id)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        debug!(%id, "device database entry removed");
        Ok(())
    }
}

fn tags_of(dev: &DeviceRecord) -> Vec<&str> {
    dev.properties
        .get("TAGS")
        .map(|tags| tags.split(':').filter(|t| !t.is_empty()).collect())
        .unwrap_or_default()
}
