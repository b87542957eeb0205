//! Kernel uevent monitor transport.
//!
//! The kernel multicasts device notifications on the `kobject_uevent`
//! netlink family. The manager joins the kernel multicast group and drains
//! frames into [`DeviceRecord`]s; processed devices are re-published to the
//! subscriber multicast group in the same frame format, both by workers
//! after a successful run and by the manager itself when it forwards the
//! raw kernel view after a worker failure.
//!
//! Frame layout is the kernel's: a `ACTION@DEVPATH` header followed by
//! NUL-separated `KEY=VALUE` properties. Frames from non-kernel senders and
//! frames carrying the libudev magic are dropped.

use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{
    bind, recvmsg, sendto, setsockopt, socket, sockopt, AddressFamily, MsgFlags, NetlinkAddr,
    SockFlag, SockProtocol, SockType,
};
use rudev_core::device::{DevNum, DeviceRecord};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, warn};

/// Multicast group the kernel broadcasts uevents on.
const KERNEL_GROUP: u32 = 1;

/// Multicast group processed events are re-published on for subscribers.
const SUBSCRIBER_GROUP: u32 = 2;

/// Receive buffer for the uevent socket; bursts during coldplug are large.
const RECEIVE_BUFFER: usize = 128 * 1024 * 1024;

/// Prefix of frames produced by libudev-compatible publishers.
const LIBUDEV_MAGIC: &[u8] = b"libudev\0";

fn open_socket(groups: u32) -> io::Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkKObjectUEvent,
    )
    .map_err(io::Error::from)?;
    bind(fd.as_raw_fd(), &NetlinkAddr::new(0, groups)).map_err(io::Error::from)?;
    Ok(fd)
}

fn send_frame(fd: &OwnedFd, dev: &DeviceRecord) -> io::Result<()> {
    let frame = encode_uevent(dev);
    sendto(
        fd.as_raw_fd(),
        &frame,
        &NetlinkAddr::new(0, SUBSCRIBER_GROUP),
        MsgFlags::MSG_DONTWAIT,
    )
    .map_err(io::Error::from)?;
    Ok(())
}

/// The manager's uevent monitor.
#[derive(Debug)]
pub struct Monitor {
    fd: AsyncFd<OwnedFd>,
}

impl Monitor {
    /// Open a monitor bound to the kernel multicast group.
    ///
    /// # Errors
    ///
    /// Fails when the netlink socket cannot be created or bound.
    pub fn open() -> io::Result<Self> {
        Self::wrap(open_socket(KERNEL_GROUP)?)
    }

    /// Take over a pre-opened netlink socket from the supervisor.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor cannot be registered with the reactor.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        crate::set_nonblocking(&fd)?;
        Self::wrap(fd)
    }

    fn wrap(fd: OwnedFd) -> io::Result<Self> {
        if let Err(err) = setsockopt(&fd, sockopt::RcvBuf, &RECEIVE_BUFFER) {
            debug!(error = %err, "could not grow uevent receive buffer");
        }
        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE)?,
        })
    }

    /// The reactor handle, for readiness polling.
    #[must_use]
    pub fn async_fd(&self) -> &AsyncFd<OwnedFd> {
        &self.fd
    }

    /// Drain every pending uevent frame.
    ///
    /// Reads with `MSG_DONTWAIT` until the socket is empty; frames that do
    /// not parse as kernel uevents are dropped silently.
    ///
    /// # Errors
    ///
    /// Propagates receive errors other than the socket running dry.
    pub async fn drain(&self) -> io::Result<Vec<DeviceRecord>> {
        let mut out = Vec::new();
        loop {
            let mut guard = self.fd.readable().await?;
            match self.recv_once() {
                Ok(Some(dev)) => out.push(dev),
                Ok(None) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    fn recv_once(&self) -> io::Result<Option<DeviceRecord>> {
        let mut buf = [0u8; 8192];
        let (len, from_kernel) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<NetlinkAddr>(
                self.fd.get_ref().as_raw_fd(),
                &mut iov,
                None,
                MsgFlags::MSG_DONTWAIT,
            )
            .map_err(io::Error::from)?;
            let from_kernel = msg.address.is_some_and(|addr| addr.pid() == 0);
            (msg.bytes, from_kernel)
        };

        if !from_kernel {
            debug!("ignoring uevent frame from userspace sender");
            return Ok(None);
        }
        Ok(parse_uevent(&buf[..len]))
    }

    /// Re-publish a device to the subscriber multicast group.
    ///
    /// # Errors
    ///
    /// Propagates send failures; callers log and move on.
    pub fn publish(&self, dev: &DeviceRecord) -> io::Result<()> {
        send_frame(self.fd.get_ref(), dev)
    }
}

/// Synchronous publisher used by worker children.
#[derive(Debug)]
pub struct MonitorPublisher {
    fd: OwnedFd,
}

impl MonitorPublisher {
    /// Open a publisher socket.
    ///
    /// # Errors
    ///
    /// Fails when the netlink socket cannot be created.
    pub fn open() -> io::Result<Self> {
        Ok(Self {
            fd: open_socket(0)?,
        })
    }

    /// Publish a processed device to subscribers.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub fn publish(&self, dev: &DeviceRecord) -> io::Result<()> {
        send_frame(&self.fd, dev)
    }
}

/// Parse one kernel uevent frame.
///
/// Returns `None` for frames that are not kernel uevents (libudev magic,
/// missing header, missing mandatory properties).
#[must_use]
pub fn parse_uevent(frame: &[u8]) -> Option<DeviceRecord> {
    if frame.starts_with(LIBUDEV_MAGIC) {
        return None;
    }

    let mut fields = frame.split(|&b| b == 0);
    let header = fields.next()?;
    if !header.contains(&b'@') {
        return None;
    }

    let mut properties = std::collections::BTreeMap::new();
    for field in fields {
        let field = std::str::from_utf8(field).ok()?;
        if let Some((key, value)) = field.split_once('=') {
            properties.insert(key.to_string(), value.to_string());
        }
    }

    let action = properties.get("ACTION")?.clone();
    let devpath = properties.get("DEVPATH")?.clone();
    let seqnum = match properties.get("SEQNUM").and_then(|s| s.parse().ok()) {
        Some(seqnum) => seqnum,
        None => {
            warn!(%devpath, "uevent frame without sequence number, dropping");
            return None;
        }
    };

    let devnum = DevNum::new(
        parse_num(properties.get("MAJOR")),
        parse_num(properties.get("MINOR")),
    );
    let devname = properties.get("DEVNAME").map(|name| {
        if name.starts_with('/') {
            name.clone()
        } else {
            format!("/dev/{name}")
        }
    });

    Some(DeviceRecord {
        seqnum,
        action,
        sysname: devpath.rsplit('/').next().unwrap_or_default().to_string(),
        devpath_old: properties.get("DEVPATH_OLD").cloned(),
        subsystem: properties.get("SUBSYSTEM").cloned().unwrap_or_default(),
        devtype: properties.get("DEVTYPE").cloned(),
        devname,
        devnum,
        ifindex: parse_num(properties.get("IFINDEX")),
        devpath,
        properties,
    })
}

fn parse_num(value: Option<&String>) -> u32 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Encode a device back into the kernel frame format.
#[must_use]
pub fn encode_uevent(dev: &DeviceRecord) -> Vec<u8> {
    let mut frame = Vec::with_capacity(512);
    frame.extend_from_slice(dev.action.as_bytes());
    frame.push(b'@');
    frame.extend_from_slice(dev.devpath.as_bytes());
    frame.push(0);

    let mut push = |key: &str, value: &str| {
        frame.extend_from_slice(key.as_bytes());
        frame.push(b'=');
        frame.extend_from_slice(value.as_bytes());
        frame.push(0);
    };

    push("ACTION", &dev.action);
    push("DEVPATH", &dev.devpath);
    push("SUBSYSTEM", &dev.subsystem);
    push("SEQNUM", &dev.seqnum.to_string());
    if let Some(devtype) = &dev.devtype {
        push("DEVTYPE", devtype);
    }
    if let Some(devname) = &dev.devname {
        push("DEVNAME", devname);
    }
    if let Some(devpath_old) = &dev.devpath_old {
        push("DEVPATH_OLD", devpath_old);
    }
    if !dev.devnum.is_absent() {
        push("MAJOR", &dev.devnum.major.to_string());
        push("MINOR", &dev.devnum.minor.to_string());
    }
    if dev.ifindex > 0 {
        push("IFINDEX", &dev.ifindex.to_string());
    }

    const WELL_KNOWN: &[&str] = &[
        "ACTION",
        "DEVPATH",
        "SUBSYSTEM",
        "SEQNUM",
        "DEVTYPE",
        "DEVNAME",
        "DEVPATH_OLD",
        "MAJOR",
        "MINOR",
        "IFINDEX",
    ];
    for (key, value) in &dev.properties {
        if !WELL_KNOWN.contains(&key.as_str()) {
            push(key, value);
        }
    }

    frame
}
