//! End-to-end dispatch semantics, driven through the public engine API with
//! a recording mock in place of real worker processes.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rudev_core::config::{Config, ResolveNameTiming};
use rudev_core::device::DeviceRecord;
use rudev_core::engine::{AckOutcome, Engine, Sig, WorkerControl};
use rudev_core::queue::EventState;
use rudev_core::worker::{ExitKind, Pid};

#[derive(Debug, Default)]
struct MockControl {
    next_pid: i32,
    spawned: Vec<(Pid, u64)>,
    delivered: Vec<(Pid, u64)>,
    killed: Vec<(Pid, Sig)>,
}

impl MockControl {
    fn new() -> Self {
        Self {
            next_pid: 1000,
            ..Self::default()
        }
    }

    fn live_pids(&self) -> Vec<Pid> {
        let reaped: HashSet<Pid> = self
            .killed
            .iter()
            .filter(|(_, sig)| *sig == Sig::Kill)
            .map(|(pid, _)| *pid)
            .collect();
        self.spawned
            .iter()
            .map(|(pid, _)| *pid)
            .filter(|pid| !reaped.contains(pid))
            .collect()
    }
}

impl WorkerControl for MockControl {
    fn spawn_worker(&mut self, dev: &DeviceRecord) -> io::Result<Pid> {
        self.next_pid += 1;
        let pid = Pid::from_raw(self.next_pid);
        self.spawned.push((pid, dev.seqnum));
        Ok(pid)
    }

    fn deliver(&mut self, pid: Pid, dev: &DeviceRecord) -> io::Result<()> {
        self.delivered.push((pid, dev.seqnum));
        Ok(())
    }

    fn kill(&mut self, pid: Pid, sig: Sig) -> io::Result<()> {
        self.killed.push((pid, sig));
        Ok(())
    }
}

fn engine(children_max: u32) -> Engine {
    let config = Arc::new(Config::new(
        children_max,
        Duration::from_secs(180),
        Duration::ZERO,
        ResolveNameTiming::Early,
    ));
    Engine::new(config, None)
}

#[test]
fn same_devnum_events_are_serialized() {
    let mut engine = engine(4);
    let mut ctl = MockControl::new();
    engine.enqueue(
        DeviceRecord::builder()
            .seqnum(1)
            .devpath("/devices/x")
            .subsystem("block")
            .devnum(8, 0)
            .build(),
    );
    engine.enqueue(
        DeviceRecord::builder()
            .seqnum(2)
            .devpath("/devices/y")
            .subsystem("block")
            .devnum(8, 0)
            .build(),
    );

    engine.run_queue(&mut ctl);
    assert_eq!(ctl.spawned.len(), 1);
    assert_eq!(engine.find_event(2).unwrap().state, EventState::Queued);
    // Identity blockers are never memoized.
    assert_eq!(engine.find_event(2).unwrap().delaying_seqnum, 0);

    let pid = ctl.spawned[0].0;
    engine.on_worker_ack(pid);
    engine.run_queue(&mut ctl);
    assert_eq!(engine.find_event(2).unwrap().state, EventState::Running);
}

#[test]
fn same_ifindex_events_are_serialized() {
    let mut engine = engine(4);
    let mut ctl = MockControl::new();
    for (seqnum, devpath) in [(1, "/devices/net/a"), (2, "/devices/virtual/net/b")] {
        engine.enqueue(
            DeviceRecord::builder()
                .seqnum(seqnum)
                .devpath(devpath)
                .subsystem("net")
                .ifindex(3)
                .build(),
        );
    }

    engine.run_queue(&mut ctl);
    assert_eq!(ctl.spawned.len(), 1);
    assert_eq!(engine.find_event(2).unwrap().state, EventState::Queued);
}

#[test]
fn three_independent_events_with_cap_one_run_in_arrival_order() {
    let mut engine = engine(1);
    let mut ctl = MockControl::new();
    for seqnum in 1..=3u64 {
        engine.enqueue(
            DeviceRecord::builder()
                .seqnum(seqnum)
                .devpath(format!("/devices/dev{seqnum}"))
                .subsystem("block")
                .devnum(8, 16 * u32::try_from(seqnum).unwrap())
                .build(),
        );
    }

    let mut started = Vec::new();
    loop {
        engine.run_queue(&mut ctl);
        let running: Vec<u64> = engine
            .queue()
            .iter()
            .filter(|e| e.state == EventState::Running)
            .map(|e| e.seqnum)
            .collect();
        assert!(running.len() <= 1, "cap of one violated: {running:?}");
        let Some(&seqnum) = running.first() else {
            break;
        };
        started.push(seqnum);
        let pid = engine.find_event(seqnum).unwrap().worker.unwrap();
        engine.on_worker_ack(pid);
    }

    assert_eq!(started, vec![1, 2, 3]);
}

#[test]
fn worker_failure_frees_the_pool_slot() {
    let mut engine = engine(1);
    let mut ctl = MockControl::new();
    engine.enqueue(
        DeviceRecord::builder()
            .seqnum(1)
            .devpath("/devices/d")
            .subsystem("block")
            .devnum(8, 0)
            .build(),
    );
    engine.enqueue(
        DeviceRecord::builder()
            .seqnum(2)
            .devpath("/devices/e")
            .subsystem("block")
            .devnum(8, 16)
            .build(),
    );
    engine.run_queue(&mut ctl);
    let pid = ctl.spawned[0].0;

    engine.reap(pid, ExitKind::Exited(1));
    engine.run_queue(&mut ctl);
    assert_eq!(engine.find_event(2).unwrap().state, EventState::Running);
}

/// From-scratch conflict oracle over the public event fields.
fn conflicts(a: &rudev_core::queue::Event, b: &rudev_core::queue::Event) -> bool {
    if a.devnum.major != 0 && a.devnum == b.devnum && a.is_block == b.is_block {
        return true;
    }
    if a.ifindex > 0 && a.ifindex == b.ifindex {
        return true;
    }
    let (earlier, later) = if a.seqnum < b.seqnum { (a, b) } else { (b, a) };
    if let Some(old) = &later.devpath_old {
        if earlier.devpath == *old {
            return true;
        }
    }
    let common = a.devpath.len().min(b.devpath.len());
    if a.devpath.as_bytes()[..common] != b.devpath.as_bytes()[..common] {
        return false;
    }
    if a.devpath.len() == b.devpath.len() {
        return later.devnum.major == 0 && later.ifindex == 0;
    }
    a.devpath.as_bytes().get(common) == Some(&b'/') || b.devpath.as_bytes().get(common) == Some(&b'/')
}

fn check_invariants(engine: &Engine, cap: u32) {
    // Cap: the pool never exceeds children_max.
    assert!(engine.pool().len() <= cap as usize);

    // Unique attachment: worker <-> event is a bijection.
    let mut seen_workers = HashSet::new();
    let mut seen_events = HashSet::new();
    for event in engine.queue().iter() {
        if event.state == EventState::Running {
            let pid = event.worker.expect("running event must have a worker");
            assert!(seen_workers.insert(pid), "worker {pid} attached twice");
            assert!(seen_events.insert(event.seqnum));
            let worker = engine.pool().get(pid).expect("worker must be tracked");
            assert_eq!(worker.event(), Some(event.seqnum));
        } else {
            assert!(event.worker.is_none());
        }
    }

    // Ordering under conflict: a running event is never preceded by a
    // conflicting event that is still pending.
    let events: Vec<_> = engine.queue().iter().collect();
    for (i, later) in events.iter().enumerate() {
        if later.state != EventState::Running {
            continue;
        }
        for earlier in &events[..i] {
            assert!(
                !conflicts(earlier, later),
                "seq {} started while conflicting seq {} was pending",
                later.seqnum,
                earlier.seqnum
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Random arrivals and completions never violate the cap, the unique
    /// attachment rule, or ordering under conflict.
    #[test]
    fn prop_dispatch_invariants_hold(
        cap in 1u32..4,
        devices in proptest::collection::vec(
            (
                prop_oneof![
                    Just("/devices/a"),
                    Just("/devices/a/b"),
                    Just("/devices/a/b/c"),
                    Just("/devices/x"),
                    Just("/devices/net/eth0"),
                ],
                0u32..3,
                0u32..3,
            ),
            1..10,
        ),
        acks in proptest::collection::vec(0usize..8, 0..12),
    ) {
        let mut engine = engine(cap);
        let mut ctl = MockControl::new();

        for (i, (path, major, ifindex)) in devices.into_iter().enumerate() {
            let mut builder = DeviceRecord::builder()
                .seqnum(i as u64 + 1)
                .devpath(path)
                .subsystem("block")
                .ifindex(ifindex);
            if major > 0 {
                builder = builder.devnum(major + 7, 0);
            }
            engine.enqueue(builder.build());
            engine.run_queue(&mut ctl);
            check_invariants(&engine, cap);
        }

        for ack in acks {
            let live = ctl.live_pids();
            if live.is_empty() {
                break;
            }
            let pid = live[ack % live.len()];
            if let AckOutcome::Acknowledged { .. } = engine.on_worker_ack(pid) {
                engine.run_queue(&mut ctl);
            }
            check_invariants(&engine, cap);
        }
    }
}
