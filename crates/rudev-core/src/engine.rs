//! The dispatch engine.
//!
//! [`Engine`] binds the event queue, the conflict detector and the worker
//! pool together: it decides which queued events may run, hands them to
//! idle workers or spawns new ones up to the cap, arms the per-event
//! deadlines, and digests worker acknowledgments and child exits.
//!
//! All process side effects go through the [`WorkerControl`] seam, so the
//! engine itself never spawns, signals or talks to a socket. The daemon
//! implements the seam with real subprocesses; the test suite drives the
//! engine with a recording mock.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::config::Config;
use crate::conflict;
use crate::device::DeviceRecord;
use crate::queue::{Event, EventFilter, EventQueue, EventState};
use crate::worker::{ExitKind, Pid, WorkerPool, WorkerState};

/// Signals the engine asks the daemon to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    /// Graceful termination request.
    Term,
    /// Forced kill.
    Kill,
}

/// Process side effects the engine needs from its host.
pub trait WorkerControl {
    /// Spawn a new worker and hand it `dev` as its first event.
    ///
    /// # Errors
    ///
    /// Propagates spawn or initial-delivery failures; the event stays
    /// queued.
    fn spawn_worker(&mut self, dev: &DeviceRecord) -> io::Result<Pid>;

    /// Deliver `dev` to an existing idle worker.
    ///
    /// # Errors
    ///
    /// A failed delivery marks the worker unresponsive; the engine kills it
    /// and tries the next one.
    fn deliver(&mut self, pid: Pid, dev: &DeviceRecord) -> io::Result<()>;

    /// Send a signal to a worker.
    ///
    /// # Errors
    ///
    /// Delivery failures are logged by the engine and otherwise ignored;
    /// the worker is reaped eventually either way.
    fn kill(&mut self, pid: Pid, sig: Sig) -> io::Result<()>;
}

/// Outcome of a worker acknowledgment.
#[derive(Debug)]
pub enum AckOutcome {
    /// The sender is not a tracked worker; the message was dropped.
    Untracked,
    /// The worker went idle; `completed` is the device whose event was
    /// freed, if one was attached.
    Acknowledged {
        /// Device record of the completed event.
        completed: Option<DeviceRecord>,
    },
}

/// The failure fan-out owed after a worker died holding an event.
#[derive(Debug)]
pub struct FailedEvent {
    /// The full device view the worker was processing.
    pub dev: DeviceRecord,
    /// The unamended kernel view to re-publish to subscribers.
    pub dev_kernel: DeviceRecord,
}

/// Outcome of reaping a child process.
#[derive(Debug)]
pub enum ReapOutcome {
    /// The pid does not belong to a tracked worker.
    Untracked,
    /// The child stopped or continued; the worker is kept.
    StateChange,
    /// The worker was removed from the pool. `failed` carries the fan-out
    /// work when the worker died abnormally while holding an event.
    Reaped {
        /// Set when the failure path must run.
        failed: Option<FailedEvent>,
    },
}

/// The event dispatch engine.
#[derive(Debug)]
pub struct Engine {
    queue: EventQueue,
    pool: WorkerPool,
    config: Arc<Config>,
    stop_exec_queue: bool,
    exit: bool,
}

impl Engine {
    /// Create an engine.
    ///
    /// `marker` is the on-disk queue marker path (`None` disables it).
    #[must_use]
    pub fn new(config: Arc<Config>, marker: Option<PathBuf>) -> Self {
        Self {
            queue: EventQueue::new(marker),
            pool: WorkerPool::new(),
            config,
            stop_exec_queue: false,
            exit: false,
        }
    }

    /// The shared configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The pending-event queue.
    #[must_use]
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// The worker pool.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Returns `true` while graceful shutdown is in progress.
    #[must_use]
    pub fn exiting(&self) -> bool {
        self.exit
    }

    /// Begin graceful shutdown: no new dispatches will happen.
    pub fn begin_exit(&mut self) {
        self.exit = true;
    }

    /// Pause or resume event dispatch.
    pub fn set_stop_exec_queue(&mut self, stop: bool) {
        self.stop_exec_queue = stop;
    }

    /// Returns `true` when [`run_queue`](Self::run_queue) would be a no-op.
    #[must_use]
    pub fn dispatch_inhibited(&self) -> bool {
        self.queue.is_empty() || self.exit || self.stop_exec_queue
    }

    /// Append a freshly received device event.
    pub fn enqueue(&mut self, dev: DeviceRecord) -> u64 {
        self.queue.enqueue(dev)
    }

    /// Dispatch every queued event that is not blocked by an earlier one.
    ///
    /// Events are scanned in arrival order. An unblocked event goes to an
    /// idle worker when one exists; otherwise a new worker is spawned while
    /// the pool is below the cap. Once the cap is reached the scan stops -
    /// the next worker completion re-runs it.
    pub fn run_queue<C: WorkerControl>(&mut self, ctl: &mut C) {
        if self.dispatch_inhibited() {
            return;
        }

        let now = Instant::now();
        for index in 0..self.queue.len() {
            if self.queue.event(index).state != EventState::Queued {
                continue;
            }

            {
                let (before, rest) = self.queue.split_at_mut(index);
                if conflict::event_is_blocked(before, &mut rest[0]) {
                    continue;
                }
            }

            if !self.run_event(index, now, ctl) {
                break;
            }
        }
    }

    /// Try to start the event at `index`. Returns `false` when the scan
    /// should stop (cap reached or spawn failed).
    fn run_event<C: WorkerControl>(&mut self, index: usize, now: Instant, ctl: &mut C) -> bool {
        let seqnum = self.queue.event(index).seqnum;

        for pid in self.pool.idle_pids() {
            match ctl.deliver(pid, &self.queue.event(index).dev) {
                Ok(()) => {
                    self.attach(index, pid, now);
                    debug!(seqnum, %pid, "event delivered to idle worker");
                    return true;
                }
                Err(err) => {
                    error!(%pid, error = %err, "worker did not accept event, killing it");
                    if let Err(err) = ctl.kill(pid, Sig::Kill) {
                        debug!(%pid, error = %err, "failed to kill unresponsive worker");
                    }
                    self.pool.mark_killed(pid);
                }
            }
        }

        if self.pool.len() >= self.config.children_max() as usize {
            debug!(
                children = self.pool.len(),
                "maximum number of children reached"
            );
            return false;
        }

        match ctl.spawn_worker(&self.queue.event(index).dev) {
            Ok(pid) => {
                if let Err(err) = self.pool.insert(pid) {
                    error!(%pid, error = %err, "refusing to track spawned worker");
                    return false;
                }
                self.attach(index, pid, now);
                debug!(seqnum, %pid, "forked new worker");
                true
            }
            Err(err) => {
                error!(seqnum, error = %err, "failed to spawn worker");
                false
            }
        }
    }

    fn attach(&mut self, index: usize, pid: Pid, now: Instant) {
        let seqnum = self.queue.event(index).seqnum;
        if let Err(err) = self.pool.attach(pid, seqnum) {
            error!(seqnum, %pid, error = %err, "could not attach event to worker");
            return;
        }
        let event = self.queue.event_mut(index);
        event.state = EventState::Running;
        event.worker = Some(pid);
        event.warned = false;
        event.warn_at = Some(now + self.config.warn_timeout());
        event.kill_at = Some(now + self.config.event_timeout);
    }

    /// Digest an acknowledgment received on the worker-ack socket.
    ///
    /// The caller has already authenticated the sender pid through
    /// `SCM_CREDENTIALS`; anything not tracked here is dropped.
    pub fn on_worker_ack(&mut self, pid: Pid) -> AckOutcome {
        if self.pool.get(pid).is_none() {
            debug!(%pid, "worker returned, but is no longer tracked");
            return AckOutcome::Untracked;
        }

        self.pool.mark_idle(pid);
        let completed = self
            .pool
            .detach(pid)
            .and_then(|seqnum| self.queue.remove(seqnum))
            .map(|event| event.dev);
        AckOutcome::Acknowledged { completed }
    }

    /// Digest one `waitpid` result.
    pub fn reap(&mut self, pid: Pid, kind: ExitKind) -> ReapOutcome {
        let Some(worker) = self.pool.get(pid) else {
            warn!(%pid, "reaped unknown child, ignoring");
            return ReapOutcome::Untracked;
        };

        match kind {
            ExitKind::Stopped => {
                debug!(%pid, "worker stopped");
                return ReapOutcome::StateChange;
            }
            ExitKind::Continued => {
                debug!(%pid, "worker continued");
                return ReapOutcome::StateChange;
            }
            ExitKind::Exited(0) => debug!(%pid, "worker exited"),
            ExitKind::Exited(code) => warn!(%pid, code, "worker exited with return code"),
            ExitKind::Signaled(signo) => warn!(%pid, signo, "worker terminated by signal"),
        }

        let expected_signal = worker.state() == WorkerState::Killed;
        let failure = match kind {
            ExitKind::Exited(code) => code != 0,
            ExitKind::Signaled(_) => !expected_signal,
            ExitKind::Stopped | ExitKind::Continued => unreachable!(),
        };

        let mut failed = None;
        if let Some(worker) = self.pool.remove(pid) {
            if let Some(seqnum) = worker.event() {
                if let Some(event) = self.queue.remove(seqnum) {
                    if failure {
                        error!(%pid, devpath = %event.devpath, "worker failed while handling event");
                        failed = Some(FailedEvent {
                            dev: event.dev,
                            dev_kernel: event.dev_kernel,
                        });
                    }
                }
            }
        }

        ReapOutcome::Reaped { failed }
    }

    /// SIGTERM every worker not already on its way out.
    ///
    /// Used for reload, idle cleanup, environment and log-level changes,
    /// and graceful shutdown.
    pub fn kill_workers<C: WorkerControl>(&mut self, ctl: &mut C) {
        for pid in self.pool.non_killed_pids() {
            self.pool.mark_killed(pid);
            if let Err(err) = ctl.kill(pid, Sig::Term) {
                debug!(%pid, error = %err, "failed to signal worker");
            }
        }
    }

    /// Fire overdue per-event deadlines.
    ///
    /// Each running event warns exactly once at a third of the timeout and
    /// is SIGKILLed exactly once at the timeout.
    pub fn fire_deadlines<C: WorkerControl>(&mut self, now: Instant, ctl: &mut C) {
        for index in 0..self.queue.len() {
            let overdue = {
                let event = self.queue.event_mut(index);
                if event.state != EventState::Running {
                    continue;
                }
                if event.warn_at.is_some_and(|at| at <= now) {
                    event.warn_at = None;
                    event.warned = true;
                    warn!(
                        seqnum = event.seqnum,
                        devpath = %event.devpath,
                        "event is taking a long time"
                    );
                }
                if event.kill_at.is_some_and(|at| at <= now) {
                    event.kill_at = None;
                    event.worker.map(|pid| (event.seqnum, pid))
                } else {
                    None
                }
            };

            if let Some((seqnum, pid)) = overdue {
                error!(seqnum, %pid, "event timed out, killing worker");
                if let Err(err) = ctl.kill(pid, Sig::Kill) {
                    debug!(%pid, error = %err, "failed to kill timed-out worker");
                }
                self.pool.mark_killed(pid);
            }
        }
    }

    /// The earliest armed per-event deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter(|e| e.state == EventState::Running)
            .flat_map(|e| e.warn_at.into_iter().chain(e.kill_at))
            .min()
    }

    /// Drop pending events matching `filter`, detaching them from workers.
    pub fn cleanup_queue(&mut self, filter: EventFilter) {
        let removed = self.queue.cleanup(filter);
        for event in &removed {
            if let Some(pid) = event.worker {
                self.pool.detach(pid);
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "discarded queued events");
        }
    }

    /// Direct access to a queued event, for the daemon's handlers.
    #[must_use]
    pub fn find_event(&self, seqnum: u64) -> Option<&Event> {
        self.queue.find(seqnum)
    }
}
