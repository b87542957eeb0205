//! Worker process bookkeeping.
//!
//! One [`Worker`] record exists per live child process. The pool tracks the
//! pid-to-worker mapping; the actual OS processes are owned by the daemon's
//! spawner. A worker holds at most one event at a time, referenced by
//! sequence number, with the event keeping a non-owning back-reference to
//! the worker's pid.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Process id of a worker child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(i32);

impl Pid {
    /// Wrap a raw pid.
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// The raw pid value.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Processing an event.
    Running,
    /// Waiting for the next event.
    Idle,
    /// A termination signal has been sent; the worker is on its way out.
    Killed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// How a reaped child terminated, as reported by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with the given status code.
    Exited(i32),
    /// Terminated by the given signal.
    Signaled(i32),
    /// Stopped by a signal; the process still exists.
    Stopped,
    /// Resumed after a stop; the process still exists.
    Continued,
}

/// One live worker child.
#[derive(Debug)]
pub struct Worker {
    pid: Pid,
    state: WorkerState,
    event: Option<u64>,
}

impl Worker {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: WorkerState::Idle,
            event: None,
        }
    }

    /// The worker's pid.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Current worker state.
    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    /// Seqnum of the attached event, if any.
    #[must_use]
    pub const fn event(&self) -> Option<u64> {
        self.event
    }
}

/// Errors from worker pool operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Worker pids must belong to real child processes.
    #[error("invalid worker pid {0}")]
    InvalidPid(i32),

    /// A worker with this pid is already tracked.
    #[error("worker {0} already tracked")]
    AlreadyTracked(Pid),

    /// Attach preconditions violated.
    #[error("worker {0} already has an event attached")]
    Busy(Pid),
}

/// The set of live workers, keyed by pid.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: HashMap<Pid, Worker>,
}

impl WorkerPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns `true` if no workers are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Look up a worker by pid.
    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Worker> {
        self.workers.get(&pid)
    }

    /// Register a newly spawned worker in `Idle` state.
    ///
    /// # Errors
    ///
    /// Rejects pids that cannot belong to a child (`<= 1`) and duplicates.
    pub fn insert(&mut self, pid: Pid) -> Result<(), WorkerPoolError> {
        if pid.as_raw() <= 1 {
            return Err(WorkerPoolError::InvalidPid(pid.as_raw()));
        }
        if self.workers.contains_key(&pid) {
            return Err(WorkerPoolError::AlreadyTracked(pid));
        }
        self.workers.insert(pid, Worker::new(pid));
        Ok(())
    }

    /// Attach an event to a worker, moving it to `Running`.
    ///
    /// # Errors
    ///
    /// Fails if the worker is unknown or already holds an event.
    pub fn attach(&mut self, pid: Pid, seqnum: u64) -> Result<(), WorkerPoolError> {
        let worker = self
            .workers
            .get_mut(&pid)
            .ok_or(WorkerPoolError::InvalidPid(pid.as_raw()))?;
        if worker.event.is_some() {
            return Err(WorkerPoolError::Busy(pid));
        }
        worker.state = WorkerState::Running;
        worker.event = Some(seqnum);
        Ok(())
    }

    /// Detach the worker's event, if any, returning its seqnum.
    pub fn detach(&mut self, pid: Pid) -> Option<u64> {
        self.workers.get_mut(&pid).and_then(|w| w.event.take())
    }

    /// Move a worker back to `Idle` after it acknowledged an event.
    ///
    /// Workers already marked `Killed` stay killed; their ack is still
    /// honored but they will not be reused.
    pub fn mark_idle(&mut self, pid: Pid) {
        if let Some(worker) = self.workers.get_mut(&pid) {
            if worker.state != WorkerState::Killed {
                worker.state = WorkerState::Idle;
            }
        }
    }

    /// Mark a worker as killed (a termination signal is on its way).
    pub fn mark_killed(&mut self, pid: Pid) {
        if let Some(worker) = self.workers.get_mut(&pid) {
            worker.state = WorkerState::Killed;
        }
    }

    /// Remove a worker from the pool, returning its record.
    pub fn remove(&mut self, pid: Pid) -> Option<Worker> {
        self.workers.remove(&pid)
    }

    /// Pids of workers currently waiting for an event.
    #[must_use]
    pub fn idle_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Idle)
            .map(Worker::pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Pids of workers that have not been sent a termination signal yet.
    #[must_use]
    pub fn non_killed_pids(&self) -> Vec<Pid> {
        self.workers
            .values()
            .filter(|w| w.state != WorkerState::Killed)
            .map(Worker::pid)
            .collect()
    }

    /// Iterate over all workers.
    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_rejects_bogus_pids() {
        let mut pool = WorkerPool::new();
        assert!(matches!(
            pool.insert(Pid::from_raw(0)),
            Err(WorkerPoolError::InvalidPid(0))
        ));
        assert!(matches!(
            pool.insert(Pid::from_raw(1)),
            Err(WorkerPoolError::InvalidPid(1))
        ));

        pool.insert(Pid::from_raw(100)).unwrap();
        assert!(matches!(
            pool.insert(Pid::from_raw(100)),
            Err(WorkerPoolError::AlreadyTracked(_))
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_attach_is_exclusive() {
        let mut pool = WorkerPool::new();
        let pid = Pid::from_raw(100);
        pool.insert(pid).unwrap();

        pool.attach(pid, 1).unwrap();
        assert_eq!(pool.get(pid).unwrap().state(), WorkerState::Running);
        assert_eq!(pool.get(pid).unwrap().event(), Some(1));

        assert!(matches!(pool.attach(pid, 2), Err(WorkerPoolError::Busy(_))));

        assert_eq!(pool.detach(pid), Some(1));
        pool.attach(pid, 2).unwrap();
    }

    #[test]
    fn test_killed_worker_stays_killed() {
        let mut pool = WorkerPool::new();
        let pid = Pid::from_raw(100);
        pool.insert(pid).unwrap();
        pool.mark_killed(pid);
        pool.mark_idle(pid);
        assert_eq!(pool.get(pid).unwrap().state(), WorkerState::Killed);
        assert!(pool.idle_pids().is_empty());
    }

    #[test]
    fn test_idle_pids_sorted() {
        let mut pool = WorkerPool::new();
        for pid in [300, 100, 200] {
            pool.insert(Pid::from_raw(pid)).unwrap();
        }
        let pids: Vec<i32> = pool.idle_pids().iter().map(|p| p.as_raw()).collect();
        assert_eq!(pids, vec![100, 200, 300]);
    }
}
