//! Device records received from the uevent monitor.
//!
//! A [`DeviceRecord`] is the view of one kernel notification that the
//! dispatch engine works with. The monitor transport in `rudev-daemon`
//! builds records from raw netlink frames; workers receive them re-encoded
//! over their hand-off socket.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Action tag carried by device-removal events.
pub const ACTION_REMOVE: &str = "remove";

/// Block/character device numbers. `(0, 0)` means the device has no node.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DevNum {
    /// Major device number.
    pub major: u32,
    /// Minor device number.
    pub minor: u32,
}

impl DevNum {
    /// Create device numbers from a major/minor pair.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Returns `true` if the device has no device node.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        self.major == 0 && self.minor == 0
    }
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// One kernel device notification.
///
/// Fields mirror the uevent properties the dispatch engine and the workers
/// consume; everything else the kernel sent rides along in `properties`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Monotonically increasing event identifier assigned by the kernel.
    pub seqnum: u64,

    /// Event action ("add", "change", "remove", "move", ...).
    pub action: String,

    /// Kernel device path below `/sys` (e.g. `/devices/.../sda/sda1`).
    pub devpath: String,

    /// Previous device path, present on renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devpath_old: Option<String>,

    /// Kernel subsystem ("block", "net", "usb", ...).
    pub subsystem: String,

    /// Device type within the subsystem ("disk", "partition", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devtype: Option<String>,

    /// Last component of the device path.
    pub sysname: String,

    /// Device node path below `/dev`, if the device has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devname: Option<String>,

    /// Device numbers; `(0, 0)` if the device has no node.
    #[serde(default)]
    pub devnum: DevNum,

    /// Network interface index; `0` if the device is not a netdev.
    #[serde(default)]
    pub ifindex: u32,

    /// Remaining uevent properties, key to value.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DeviceRecord {
    /// Create a new builder for `DeviceRecord`.
    #[must_use]
    pub fn builder() -> DeviceRecordBuilder {
        DeviceRecordBuilder::default()
    }

    /// Returns `true` if the device belongs to the "block" subsystem.
    #[must_use]
    pub fn is_block(&self) -> bool {
        self.subsystem == "block"
    }

    /// Returns `true` for removal events.
    #[must_use]
    pub fn is_remove(&self) -> bool {
        self.action == ACTION_REMOVE
    }

    /// Absolute sysfs path of the device.
    #[must_use]
    pub fn syspath(&self) -> String {
        format!("/sys{}", self.devpath)
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq {} {} {}", self.seqnum, self.action, self.devpath)
    }
}

/// Builder for [`DeviceRecord`].
#[derive(Debug, Default)]
pub struct DeviceRecordBuilder {
    seqnum: u64,
    action: Option<String>,
    devpath: Option<String>,
    devpath_old: Option<String>,
    subsystem: Option<String>,
    devtype: Option<String>,
    devname: Option<String>,
    devnum: DevNum,
    ifindex: u32,
    properties: BTreeMap<String, String>,
}

impl DeviceRecordBuilder {
    /// Set the kernel sequence number.
    #[must_use]
    pub const fn seqnum(mut self, seqnum: u64) -> Self {
        self.seqnum = seqnum;
        self
    }

    /// Set the event action.
    #[must_use]
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Set the kernel device path.
    #[must_use]
    pub fn devpath(mut self, devpath: impl Into<String>) -> Self {
        self.devpath = Some(devpath.into());
        self
    }

    /// Set the previous device path (renames).
    #[must_use]
    pub fn devpath_old(mut self, devpath_old: impl Into<String>) -> Self {
        self.devpath_old = Some(devpath_old.into());
        self
    }

    /// Set the subsystem.
    #[must_use]
    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = Some(subsystem.into());
        self
    }

    /// Set the device type.
    #[must_use]
    pub fn devtype(mut self, devtype: impl Into<String>) -> Self {
        self.devtype = Some(devtype.into());
        self
    }

    /// Set the device node path.
    #[must_use]
    pub fn devname(mut self, devname: impl Into<String>) -> Self {
        self.devname = Some(devname.into());
        self
    }

    /// Set the device numbers.
    #[must_use]
    pub const fn devnum(mut self, major: u32, minor: u32) -> Self {
        self.devnum = DevNum::new(major, minor);
        self
    }

    /// Set the network interface index.
    #[must_use]
    pub const fn ifindex(mut self, ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self
    }

    /// Add a uevent property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Build the `DeviceRecord`.
    ///
    /// # Panics
    ///
    /// Panics if `devpath` is not set.
    #[must_use]
    pub fn build(self) -> DeviceRecord {
        let devpath = self.devpath.expect("devpath is required");
        let sysname = devpath.rsplit('/').next().unwrap_or_default().to_string();
        DeviceRecord {
            seqnum: self.seqnum,
            action: self.action.unwrap_or_else(|| "add".to_string()),
            devpath,
            devpath_old: self.devpath_old,
            subsystem: self.subsystem.unwrap_or_default(),
            devtype: self.devtype,
            sysname,
            devname: self.devname,
            devnum: self.devnum,
            ifindex: self.ifindex,
            properties: self.properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_derives_sysname() {
        let dev = DeviceRecord::builder()
            .seqnum(7)
            .devpath("/devices/virtual/block/loop0")
            .subsystem("block")
            .build();

        assert_eq!(dev.sysname, "loop0");
        assert_eq!(dev.syspath(), "/sys/devices/virtual/block/loop0");
        assert!(dev.is_block());
        assert!(!dev.is_remove());
    }

    #[test]
    fn test_devnum_absent() {
        assert!(DevNum::default().is_absent());
        assert!(!DevNum::new(8, 0).is_absent());
        assert_eq!(DevNum::new(8, 1).to_string(), "8:1");
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let dev = DeviceRecord::builder()
            .seqnum(42)
            .action("change")
            .devpath("/devices/virtual/block/dm-0")
            .subsystem("block")
            .devtype("disk")
            .devname("/dev/dm-0")
            .devnum(253, 0)
            .property("DM_NAME", "vg-root")
            .build();

        let json = serde_json::to_string(&dev).unwrap();
        let back: DeviceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dev);
    }
}
