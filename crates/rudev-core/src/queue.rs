//! Event records and the pending-event queue.
//!
//! The queue is append-only in arrival order, which equals seqnum order
//! because the kernel assigns seqnums monotonically. Removals happen
//! anywhere: on worker acknowledgment, on queue cleanup, and on teardown.
//!
//! While the queue is non-empty an on-disk marker (`/run/udev/queue` in
//! production) is kept in place so other tools can tell that device events
//! are still in flight. Only the process that created the queue touches the
//! marker.

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, warn};

use crate::device::{DevNum, DeviceRecord};
use crate::worker::Pid;

/// Event state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Waiting for dispatch.
    Queued,
    /// Attached to a worker.
    Running,
}

/// Filter for [`EventQueue::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Remove every event.
    Any,
    /// Remove only events still waiting for dispatch.
    Queued,
}

/// One pending or in-flight device event.
#[derive(Debug)]
pub struct Event {
    /// Kernel sequence number; unique and strictly increasing in the queue.
    pub seqnum: u64,
    /// Kernel device path, cached from the record for the conflict scan.
    pub devpath: String,
    /// Previous device path on renames.
    pub devpath_old: Option<String>,
    /// Device numbers; `(0, 0)` when absent.
    pub devnum: DevNum,
    /// Whether the device belongs to the "block" subsystem.
    pub is_block: bool,
    /// Network interface index; `0` when not a netdev.
    pub ifindex: u32,
    /// Current state.
    pub state: EventState,
    /// Pid of the assigned worker while running.
    pub worker: Option<Pid>,
    /// Earliest seqnum known to currently block this event. Lets repeated
    /// conflict scans skip predecessors that were already cleared.
    pub delaying_seqnum: u64,
    /// Deadline for the slow-event warning; armed while running.
    pub warn_at: Option<Instant>,
    /// Deadline for the hard kill; armed while running.
    pub kill_at: Option<Instant>,
    /// Whether the slow-event warning already fired.
    pub warned: bool,
    /// The full device view handed to the worker.
    pub dev: DeviceRecord,
    /// Unamended kernel view, re-published verbatim if the worker fails.
    pub dev_kernel: DeviceRecord,
}

impl Event {
    fn new(dev: DeviceRecord) -> Self {
        let dev_kernel = dev.clone();
        Self {
            seqnum: dev.seqnum,
            devpath: dev.devpath.clone(),
            devpath_old: dev.devpath_old.clone(),
            devnum: dev.devnum,
            is_block: dev.is_block(),
            ifindex: dev.ifindex,
            state: EventState::Queued,
            worker: None,
            delaying_seqnum: 0,
            warn_at: None,
            kill_at: None,
            warned: false,
            dev,
            dev_kernel,
        }
    }
}

/// FIFO of pending device events.
#[derive(Debug)]
pub struct EventQueue {
    events: Vec<Event>,
    marker: Option<PathBuf>,
    owner_pid: Option<u32>,
}

impl EventQueue {
    /// Create an empty queue.
    ///
    /// `marker` is the path of the on-disk presence marker; `None` disables
    /// the marker entirely.
    #[must_use]
    pub fn new(marker: Option<PathBuf>) -> Self {
        Self {
            events: Vec::new(),
            marker,
            owner_pid: None,
        }
    }

    /// Number of queued and running events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate over events in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// The event at `index` in arrival order.
    #[must_use]
    pub fn event(&self, index: usize) -> &Event {
        &self.events[index]
    }

    /// Mutable access to the event at `index`.
    pub fn event_mut(&mut self, index: usize) -> &mut Event {
        &mut self.events[index]
    }

    /// Split the queue at `index`, yielding the predecessors and the rest.
    ///
    /// Used by the conflict detector, which scans the predecessors while
    /// updating the candidate's memo.
    pub fn split_at_mut(&mut self, index: usize) -> (&mut [Event], &mut [Event]) {
        self.events.split_at_mut(index)
    }

    /// Look up an event by seqnum.
    #[must_use]
    pub fn find(&self, seqnum: u64) -> Option<&Event> {
        self.index_of(seqnum).map(|i| &self.events[i])
    }

    /// Mutable lookup by seqnum.
    pub fn find_mut(&mut self, seqnum: u64) -> Option<&mut Event> {
        self.index_of(seqnum).map(move |i| &mut self.events[i])
    }

    fn index_of(&self, seqnum: u64) -> Option<usize> {
        self.events.binary_search_by_key(&seqnum, |e| e.seqnum).ok()
    }

    /// Append a freshly received device to the queue.
    ///
    /// The first enqueue pins the owner pid; later enqueues must come from
    /// the same process. Transitioning from empty to non-empty creates the
    /// on-disk marker (best effort).
    pub fn enqueue(&mut self, dev: DeviceRecord) -> u64 {
        let pid = std::process::id();
        let owner = *self.owner_pid.get_or_insert(pid);
        debug_assert_eq!(owner, pid, "only the owning process may enqueue");

        debug!(
            seqnum = dev.seqnum,
            action = %dev.action,
            subsystem = %dev.subsystem,
            "event queued"
        );

        if self.events.is_empty() {
            self.touch_marker();
        }

        let seqnum = dev.seqnum;
        self.events.push(Event::new(dev));
        seqnum
    }

    /// Unlink the event with the given seqnum, returning its record.
    ///
    /// Clears timers and the worker back-reference; unlinks the marker if
    /// the queue just became empty and the current pid owns it.
    pub fn remove(&mut self, seqnum: u64) -> Option<Event> {
        let index = self.index_of(seqnum)?;
        let mut event = self.events.remove(index);
        event.warn_at = None;
        event.kill_at = None;
        event.worker = None;
        if self.events.is_empty() {
            self.unlink_marker();
        }
        Some(event)
    }

    /// Remove every event matching `filter`, returning the removed records.
    pub fn cleanup(&mut self, filter: EventFilter) -> Vec<Event> {
        let mut removed = Vec::new();
        let mut kept = Vec::new();
        for mut event in self.events.drain(..) {
            let matches = match filter {
                EventFilter::Any => true,
                EventFilter::Queued => event.state == EventState::Queued,
            };
            if matches {
                event.warn_at = None;
                event.kill_at = None;
                removed.push(event);
            } else {
                kept.push(event);
            }
        }
        self.events = kept;
        if self.events.is_empty() && !removed.is_empty() {
            self.unlink_marker();
        }
        removed
    }

    fn touch_marker(&self) {
        let Some(path) = &self.marker else { return };
        if let Err(err) = std::fs::File::create(path) {
            warn!(path = %path.display(), error = %err, "could not touch queue marker");
        }
    }

    fn unlink_marker(&self) {
        let Some(path) = &self.marker else { return };
        // Only the process that created the queue cleans up the marker.
        if self.owner_pid != Some(std::process::id()) {
            return;
        }
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "could not unlink queue marker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRecord;

    fn dev(seqnum: u64, devpath: &str) -> DeviceRecord {
        DeviceRecord::builder()
            .seqnum(seqnum)
            .devpath(devpath)
            .subsystem("block")
            .build()
    }

    #[test]
    fn test_enqueue_keeps_arrival_order() {
        let mut queue = EventQueue::new(None);
        queue.enqueue(dev(1, "/devices/a"));
        queue.enqueue(dev(2, "/devices/b"));
        queue.enqueue(dev(5, "/devices/c"));

        let seqs: Vec<u64> = queue.iter().map(|e| e.seqnum).collect();
        assert_eq!(seqs, vec![1, 2, 5]);
        assert_eq!(queue.find(2).unwrap().devpath, "/devices/b");
        assert!(queue.find(3).is_none());
    }

    #[test]
    fn test_remove_clears_timers_and_worker() {
        let mut queue = EventQueue::new(None);
        queue.enqueue(dev(1, "/devices/a"));
        {
            let event = queue.find_mut(1).unwrap();
            event.state = EventState::Running;
            event.worker = Some(crate::worker::Pid::from_raw(99));
            event.warn_at = Some(Instant::now());
            event.kill_at = Some(Instant::now());
        }
        let event = queue.remove(1).unwrap();
        assert!(event.worker.is_none());
        assert!(event.warn_at.is_none());
        assert!(event.kill_at.is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cleanup_filters_by_state() {
        let mut queue = EventQueue::new(None);
        queue.enqueue(dev(1, "/devices/a"));
        queue.enqueue(dev(2, "/devices/b"));
        queue.find_mut(1).unwrap().state = EventState::Running;

        let removed = queue.cleanup(EventFilter::Queued);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].seqnum, 2);
        assert_eq!(queue.len(), 1);

        let removed = queue.cleanup(EventFilter::Any);
        assert_eq!(removed.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_marker_tracks_queue_presence() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("queue");
        let mut queue = EventQueue::new(Some(marker.clone()));

        assert!(!marker.exists());
        queue.enqueue(dev(1, "/devices/a"));
        queue.enqueue(dev(2, "/devices/b"));
        assert!(marker.exists());

        queue.remove(1);
        assert!(marker.exists());
        queue.remove(2);
        assert!(!marker.exists());

        queue.enqueue(dev(3, "/devices/c"));
        assert!(marker.exists());
        queue.cleanup(EventFilter::Any);
        assert!(!marker.exists());
    }
}
