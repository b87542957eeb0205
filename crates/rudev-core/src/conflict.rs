//! Conflict detection between pending device events.
//!
//! Two events may run concurrently only if their target devices do not
//! interact. An event is blocked while an earlier event exists for the same
//! device node, the same network interface, the same device path, an
//! ancestor or descendant path, or the path the event was renamed from.
//!
//! Scans are memoized through [`Event::delaying_seqnum`]: once a path-based
//! blocker is found, later scans skip straight past everything older.
//! Identity blockers (device numbers, ifindex) deliberately do **not**
//! update the memo: a device can change its devnum, and an ifindex can
//! reappear at a different path, so those matches are only valid for the
//! scan that found them.

use crate::queue::Event;

/// Check whether `event` is blocked by any of its `predecessors`.
///
/// `predecessors` must be the queue slice strictly before the event, in
/// arrival (seqnum) order. Updates the event's memo on path-based blockers.
pub fn event_is_blocked(predecessors: &[Event], event: &mut Event) -> bool {
    for earlier in predecessors {
        // An even earlier scan already cleared everything below the memo.
        if earlier.seqnum < event.delaying_seqnum {
            continue;
        }

        // The memoized blocker still exists.
        if earlier.seqnum == event.delaying_seqnum {
            return true;
        }

        // Reached ourselves; nothing later can block us.
        if earlier.seqnum >= event.seqnum {
            break;
        }

        // Same device node. Not memoizable: names and numbers may swap.
        if event.devnum.major != 0
            && event.devnum == earlier.devnum
            && event.is_block == earlier.is_block
        {
            return true;
        }

        // Same network interface. Not memoizable either.
        if event.ifindex > 0 && event.ifindex == earlier.ifindex {
            return true;
        }

        // The path we were renamed from is still being processed.
        if let Some(devpath_old) = &event.devpath_old {
            if earlier.devpath == *devpath_old {
                event.delaying_seqnum = earlier.seqnum;
                return true;
            }
        }

        let common = earlier.devpath.len().min(event.devpath.len());
        if earlier.devpath.as_bytes()[..common] != event.devpath.as_bytes()[..common] {
            continue;
        }

        if earlier.devpath.len() == event.devpath.len() {
            // Identical path. If either event carries a node or an ifindex
            // the identity checks above already cover it, and device names
            // might have swapped in the meantime.
            if event.devnum.major != 0 || event.ifindex > 0 {
                continue;
            }
            event.delaying_seqnum = earlier.seqnum;
            return true;
        }

        // Earlier event on an ancestor of our device.
        if event.devpath.as_bytes().get(common) == Some(&b'/') {
            event.delaying_seqnum = earlier.seqnum;
            return true;
        }

        // Earlier event on a descendant of our device.
        if earlier.devpath.as_bytes().get(common) == Some(&b'/') {
            event.delaying_seqnum = earlier.seqnum;
            return true;
        }
    }

    false
}


#[cfg(test)]
mod prop_tests {
    use proptest::prelude::*;

    use super::*;
    use crate::device::DeviceRecord;
    use crate::queue::{Event, EventQueue};

    /// Reference scan without the `delaying_seqnum` fast path.
    fn blocked_reference(predecessors: &[Event], event: &Event) -> bool {
        for earlier in predecessors {
            if earlier.seqnum >= event.seqnum {
                break;
            }
            if event.devnum.major != 0
                && event.devnum == earlier.devnum
                && event.is_block == earlier.is_block
            {
                return true;
            }
            if event.ifindex > 0 && event.ifindex == earlier.ifindex {
                return true;
            }
            if let Some(devpath_old) = &event.devpath_old {
                if earlier.devpath == *devpath_old {
                    return true;
                }
            }
            let common = earlier.devpath.len().min(event.devpath.len());
            if earlier.devpath.as_bytes()[..common] != event.devpath.as_bytes()[..common] {
                continue;
            }
            if earlier.devpath.len() == event.devpath.len() {
                if event.devnum.major != 0 || event.ifindex > 0 {
                    continue;
                }
                return true;
            }
            if event.devpath.as_bytes().get(common) == Some(&b'/')
                || earlier.devpath.as_bytes().get(common) == Some(&b'/')
            {
                return true;
            }
        }
        false
    }

    fn arb_queue() -> impl Strategy<Value = Vec<DeviceRecord>> {
        // A small universe of paths and identities so collisions are common.
        let path = prop_oneof![
            Just("/devices/a"),
            Just("/devices/a/b"),
            Just("/devices/a/b/c"),
            Just("/devices/x"),
            Just("/devices/xy"),
            Just("/devices/net/eth0"),
        ];
        proptest::collection::vec((path, 0u32..3, 0u32..3, proptest::bool::ANY), 1..12).prop_map(
            |specs| {
                specs
                    .into_iter()
                    .enumerate()
                    .map(|(i, (path, major, ifindex, is_block))| {
                        let mut builder = DeviceRecord::builder()
                            .seqnum(i as u64 + 1)
                            .devpath(path)
                            .subsystem(if is_block { "block" } else { "test" })
                            .ifindex(ifindex);
                        if major > 0 {
                            builder = builder.devnum(major + 7, 0);
                        }
                        builder.build()
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        /// The memoized scan and the from-scratch scan always agree, even
        /// after repeated scans and arbitrary completions mutated the memo.
        #[test]
        fn prop_memoized_scan_matches_reference(
            devices in arb_queue(),
            completions in proptest::collection::vec(0usize..12, 0..8),
        ) {
            let mut queue = EventQueue::new(None);
            for dev in devices {
                queue.enqueue(dev);
            }

            // Interleave removals (acks) with re-scans of every event.
            for completed in completions {
                for index in 0..queue.len() {
                    let expected = {
                        let (before, rest) = queue.split_at_mut(index);
                        blocked_reference(before, &rest[0])
                    };
                    let got = {
                        let (before, rest) = queue.split_at_mut(index);
                        event_is_blocked(before, &mut rest[0])
                    };
                    prop_assert_eq!(got, expected);
                }

                if !queue.is_empty() {
                    let seqnum = queue.event(completed % queue.len()).seqnum;
                    queue.remove(seqnum);
                }
            }
        }
    }
}
