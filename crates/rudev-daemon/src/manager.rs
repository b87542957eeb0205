//! The manager: a single-threaded reactor driving the dispatch engine.
//!
//! One task on a current-thread runtime multiplexes every input source:
//! signals, the worker acknowledgment socket, the uevent monitor, inotify,
//! timers, and - at the lowest priority, so replies reflect a fully drained
//! queue - the control socket. Handlers run to completion and never block;
//! all sockets are nonblocking and drained until they run dry. After every
//! iteration the post hook decides whether to arm the idle-worker cleanup
//! timer, terminate the loop, or sweep the cgroup for strays.

use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::inotify::AddWatchFlags;
use nix::sys::socket::{
    recvmsg, setsockopt, socketpair, sockopt, AddressFamily, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr, UnixCredentials,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use rudev_core::config::Config;
use rudev_core::control::ControlOp;
use rudev_core::device::DeviceRecord;
use rudev_core::engine::{AckOutcome, Engine, FailedEvent, ReapOutcome};
use rudev_core::queue::EventFilter;
use rudev_core::worker::{ExitKind, Pid};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::cgroup;
use crate::ctrl::{CtrlConnection, CtrlListener};
use crate::db::DeviceDb;
use crate::logging::{filter_for_priority, LevelHandle};
use crate::monitor::Monitor;
use crate::notify::Notifier;
use crate::rules::RulesIndex;
use crate::synth::Synthesizer;
use crate::watch::WatchRegistry;
use crate::worker::{WorkerSpawner, ACK_MESSAGE};

/// Grace period between graceful-shutdown start and forced loop exit.
const EXIT_GRACE: Duration = Duration::from_secs(30);

/// Idle workers are cleaned up after this much queue inactivity.
const IDLE_WORKER_CLEANUP: Duration = Duration::from_secs(3);

/// Rules freshness is checked at most this often.
const CONFIG_RECHECK: Duration = Duration::from_secs(3);

/// Errors terminating the manager loop.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Workers did not finish within the shutdown grace period.
    #[error("gave up waiting for workers to finish")]
    ExitTimeout,

    /// Unrecoverable I/O failure on a reactor source.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Startup wiring for [`Manager::new`].
pub struct ManagerOptions {
    /// Shared runtime configuration.
    pub config: Arc<Config>,
    /// Reload handle of the installed subscriber.
    pub log_handle: LevelHandle,
    /// Log priority workers start with.
    pub log_priority: u32,
    /// Pre-opened control socket, if the supervisor passed one.
    pub fd_ctrl: Option<OwnedFd>,
    /// Pre-opened uevent socket, if the supervisor passed one.
    pub fd_uevent: Option<OwnedFd>,
    /// The daemon's cgroup, for stray-process cleanup.
    pub cgroup: Option<String>,
    /// Runtime state directory (`/run/udev`).
    pub runtime_dir: PathBuf,
}

/// Everything the reactor selects over.
struct Sources {
    monitor: Option<Monitor>,
    ctrl: Option<CtrlListener>,
    watches: Option<WatchRegistry>,
    ack_rx: AsyncFd<OwnedFd>,
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
    sigchld: Signal,
}

/// One reactor wake-up, routed through a single dispatch.
#[derive(Debug, Clone, Copy)]
enum Wake {
    SigChld,
    Shutdown,
    Reload,
    WorkerAck,
    Uevent,
    Inotify,
    Timer,
    Ctrl,
}

/// The device-management daemon's main process state.
pub struct Manager {
    engine: Engine,
    spawner: WorkerSpawner,
    sources: Sources,
    synth: Synthesizer,
    db: DeviceDb,
    rules: Option<RulesIndex>,
    notify: Notifier,
    log_handle: LevelHandle,
    cgroup: Option<String>,
    ctrl_conn_blocking: Option<CtrlConnection>,
    last_config_check: Option<Instant>,
    idle_cleanup_at: Option<Instant>,
    exit_deadline_at: Option<Instant>,
    watchdog_interval: Option<Duration>,
    watchdog_at: Option<Instant>,
}

impl Manager {
    /// Wire up the manager: sockets, inotify, rules, signals.
    ///
    /// # Errors
    ///
    /// Fails when a socket cannot be set up or the rules index cannot be
    /// read - both fatal at startup.
    pub fn new(opts: ManagerOptions) -> io::Result<Self> {
        let monitor = match opts.fd_uevent {
            Some(fd) => Monitor::from_fd(fd)?,
            None => Monitor::open()?,
        };

        let ctrl = match opts.fd_ctrl {
            Some(fd) => CtrlListener::from_fd(fd)?,
            None => CtrlListener::bind(&opts.runtime_dir.join("control"))?,
        };

        // Unnamed socket pair from the workers back to the manager; the
        // receiving end authenticates senders via SO_PASSCRED.
        let (ack_rx, ack_tx) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(io::Error::from)?;
        setsockopt(&ack_rx, sockopt::PassCred, &true).map_err(io::Error::from)?;
        crate::set_nonblocking(&ack_rx)?;

        let mut watches = WatchRegistry::new(opts.runtime_dir.join("watch"))?;
        watches.restore();

        let rules = RulesIndex::load(opts.config.resolve_names)?;

        let engine = Engine::new(
            Arc::clone(&opts.config),
            Some(opts.runtime_dir.join("queue")),
        );
        let spawner = WorkerSpawner::new(ack_tx, Arc::clone(&opts.config), opts.log_priority);

        let sources = Sources {
            monitor: Some(monitor),
            ctrl: Some(ctrl),
            watches: Some(watches),
            ack_rx: AsyncFd::with_interest(ack_rx, Interest::READABLE)?,
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
            sigchld: signal(SignalKind::child())?,
        };

        Ok(Self {
            engine,
            spawner,
            sources,
            synth: Synthesizer::new(),
            db: DeviceDb::new(&opts.runtime_dir),
            rules: Some(rules),
            notify: Notifier::from_env(),
            log_handle: opts.log_handle,
            cgroup: opts.cgroup,
            ctrl_conn_blocking: None,
            last_config_check: None,
            idle_cleanup_at: None,
            exit_deadline_at: None,
            watchdog_interval: Notifier::watchdog_interval(),
            watchdog_at: None,
        })
    }

    /// Drive the reactor until clean shutdown.
    ///
    /// # Errors
    ///
    /// [`ManagerError::ExitTimeout`] when workers outlive the shutdown
    /// grace period; I/O errors when a reactor source fails hard.
    pub async fn run(&mut self) -> Result<(), ManagerError> {
        self.notify.ready(&format!(
            "Processing with {} children at max",
            self.engine.config().children_max()
        ));
        if let Some(interval) = self.watchdog_interval {
            self.watchdog_at = Some(Instant::now() + interval);
        }

        loop {
            let deadline = self.next_deadline();
            let wake = Self::next_wake(&mut self.sources, deadline).await;
            match wake {
                Wake::SigChld => self.on_sigchld(),
                Wake::Shutdown => self.begin_shutdown(),
                Wake::Reload => self.reload(),
                Wake::WorkerAck => self.on_worker_ack().await?,
                Wake::Uevent => self.on_uevent().await?,
                Wake::Inotify => self.on_inotify().await?,
                Wake::Timer => self.on_timer()?,
                Wake::Ctrl => self.on_ctrl().await?,
            }

            if self.post() {
                self.notify.stopping("Shutting down...");
                return Ok(());
            }
        }
    }

    async fn next_wake(sources: &mut Sources, deadline: Option<Instant>) -> Wake {
        let timer_at = tokio::time::Instant::from_std(
            deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
        );

        tokio::select! {
            biased;
            _ = sources.sigchld.recv() => Wake::SigChld,
            _ = sources.sigterm.recv() => Wake::Shutdown,
            _ = sources.sigint.recv() => Wake::Shutdown,
            _ = sources.sighup.recv() => Wake::Reload,
            _ = sources.ack_rx.readable() => Wake::WorkerAck,
            () = readable_opt(sources.monitor.as_ref().map(Monitor::async_fd)) => Wake::Uevent,
            () = readable_opt(sources.watches.as_ref().map(WatchRegistry::async_fd)) => Wake::Inotify,
            () = tokio::time::sleep_until(timer_at), if deadline.is_some() => Wake::Timer,
            // Lowest priority: control replies must observe a drained queue.
            () = readable_opt(sources.ctrl.as_ref().map(CtrlListener::async_fd)) => Wake::Ctrl,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.engine.next_deadline(),
            self.idle_cleanup_at,
            self.exit_deadline_at,
            self.watchdog_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Drain freshly arrived kernel events into the queue.
    async fn on_uevent(&mut self) -> Result<(), ManagerError> {
        let Some(monitor) = &self.sources.monitor else {
            return Ok(());
        };
        let devices = monitor.drain().await?;
        if devices.is_empty() {
            return Ok(());
        }
        for dev in devices {
            self.engine.enqueue(dev);
        }
        self.dispatch();
        Ok(())
    }

    /// Drain worker acknowledgments, authenticated via SCM_CREDENTIALS.
    async fn on_worker_ack(&mut self) -> Result<(), ManagerError> {
        let mut acked = Vec::new();
        loop {
            let mut guard = self.sources.ack_rx.readable().await?;
            match recv_ack(self.sources.ack_rx.get_ref()) {
                Ok(Some(pid)) => acked.push(pid),
                Ok(None) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }

        for pid in acked {
            if let AckOutcome::Acknowledged {
                completed: Some(dev),
            } = self.engine.on_worker_ack(pid)
            {
                self.track_watch(&dev);
            }
        }
        self.dispatch();
        Ok(())
    }

    /// Keep the watch registry in sync with completed block-device events.
    fn track_watch(&mut self, dev: &DeviceRecord) {
        let Some(watches) = &mut self.sources.watches else {
            return;
        };
        if !dev.is_block() || dev.devname.is_none() {
            return;
        }
        if dev.is_remove() {
            watches.end_device(dev);
        } else if let Err(err) = watches.begin(dev) {
            debug!(devpath = %dev.devpath, error = %err, "could not watch device node");
        }
    }

    /// Device nodes closed after writing synthesize "change" events.
    async fn on_inotify(&mut self) -> Result<(), ManagerError> {
        self.idle_cleanup_at = None;

        let Some(watches) = &mut self.sources.watches else {
            return Ok(());
        };
        let events = watches.drain().await?;
        for event in events {
            if event.mask.contains(AddWatchFlags::IN_CLOSE_WRITE) {
                if let Some(entry) = watches.lookup(event.wd) {
                    debug!(devnode = %entry.devnode.display(), "inotify close-after-write");
                    if let Err(err) = self.synth.synthesize_change(&entry.devnode, &entry.syspath)
                    {
                        warn!(
                            devnode = %entry.devnode.display(),
                            error = %err,
                            "could not synthesise 'change'"
                        );
                    }
                }
            } else if event.mask.contains(AddWatchFlags::IN_IGNORED) {
                watches.forget(event.wd);
            }
        }
        Ok(())
    }

    /// Reap children; failed workers trigger the failure fan-out.
    fn on_sigchld(&mut self) {
        loop {
            match waitpid(
                nix::unistd::Pid::from_raw(-1),
                Some(WaitPidFlag::WNOHANG),
            ) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some((pid, kind)) = classify_wait_status(status) else {
                        continue;
                    };
                    if let ReapOutcome::Reaped { failed } = self.engine.reap(pid, kind) {
                        self.spawner.forget(pid);
                        if let Some(failed) = failed {
                            self.handle_worker_failure(&failed);
                        }
                    }
                }
                Err(nix::errno::Errno::ECHILD) => break,
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => {
                    warn!(error = %err, "waitpid failed");
                    break;
                }
            }
        }

        self.dispatch();
        if self.engine.pool().is_empty() {
            self.idle_cleanup_at = None;
        }
    }

    /// Worker failure: drop on-disk state and forward the raw kernel view
    /// so subscribers still observe the event.
    fn handle_worker_failure(&mut self, failed: &FailedEvent) {
        if let Err(err) = self.db.delete(&failed.dev) {
            warn!(devpath = %failed.dev.devpath, error = %err, "could not drop device state");
        }
        if let Some(monitor) = &self.sources.monitor {
            if let Err(err) = monitor.publish(&failed.dev_kernel) {
                warn!(
                    devpath = %failed.dev_kernel.devpath,
                    error = %err,
                    "could not forward kernel event"
                );
            }
        }
    }

    /// Handle one control connection.
    async fn on_ctrl(&mut self) -> Result<(), ManagerError> {
        let conn = {
            let Some(ctrl) = &self.sources.ctrl else {
                return Ok(());
            };
            ctrl.accept().await?
        };
        let Some(conn) = conn else {
            return Ok(());
        };

        let ops = match conn.receive() {
            Ok(ops) => ops,
            Err(err) => {
                warn!(error = %err, "dropping control connection");
                return Ok(());
            }
        };

        let mut hold_connection = false;
        for op in ops {
            hold_connection |= self.apply_control_op(op);
        }
        if hold_connection {
            // The client blocks until this connection closes on exit.
            self.ctrl_conn_blocking = Some(conn);
        }
        Ok(())
    }

    /// Apply one control operation; returns `true` if the connection must
    /// be held open as the shutdown acknowledgment.
    fn apply_control_op(&mut self, op: ControlOp) -> bool {
        match op {
            ControlOp::SetLogLevel(priority) => {
                debug!(priority, "control message (SET_LOG_LEVEL)");
                if let Err(err) = self.log_handle.reload(filter_for_priority(priority)) {
                    warn!(error = %err, "could not update log level");
                }
                self.spawner.set_log_priority(priority);
                self.engine.kill_workers(&mut self.spawner);
            }
            ControlOp::StopExecQueue => {
                debug!("control message (STOP_EXEC_QUEUE)");
                self.engine.set_stop_exec_queue(true);
            }
            ControlOp::StartExecQueue => {
                debug!("control message (START_EXEC_QUEUE)");
                self.engine.set_stop_exec_queue(false);
                self.dispatch();
            }
            ControlOp::Reload => {
                debug!("control message (RELOAD)");
                self.reload();
            }
            ControlOp::SetEnv(assignment) => {
                match self.spawner.properties_mut().apply_assignment(&assignment) {
                    Ok(change) => {
                        debug!(?change, "control message (ENV)");
                        self.engine.kill_workers(&mut self.spawner);
                    }
                    Err(err) => error!(error = %err, "control message (ENV) rejected"),
                }
            }
            ControlOp::SetChildrenMax(max) => {
                debug!(max, "control message (SET_MAX_CHILDREN)");
                self.engine.config().set_children_max(max);
                self.notify
                    .ready(&format!("Processing with {max} children at max"));
            }
            ControlOp::Ping => {
                debug!("control message (PING)");
            }
            ControlOp::Exit => {
                debug!("control message (EXIT)");
                self.begin_shutdown();
                return true;
            }
        }
        false
    }

    /// Fire whichever deadlines are overdue.
    fn on_timer(&mut self) -> Result<(), ManagerError> {
        let now = Instant::now();

        self.engine.fire_deadlines(now, &mut self.spawner);

        if self.idle_cleanup_at.is_some_and(|at| at <= now) {
            self.idle_cleanup_at = None;
            debug!("cleaning up idle workers");
            self.engine.kill_workers(&mut self.spawner);
        }

        if self.watchdog_at.is_some_and(|at| at <= now) {
            self.notify.watchdog();
            self.watchdog_at = self.watchdog_interval.map(|interval| now + interval);
        }

        if self.exit_deadline_at.is_some_and(|at| at <= now) {
            error!("giving up waiting for workers to finish");
            return Err(ManagerError::ExitTimeout);
        }
        Ok(())
    }

    /// Run the dispatcher: freshness check, lazy rules rebuild, queue scan.
    fn dispatch(&mut self) {
        if self.engine.dispatch_inhibited() {
            return;
        }

        // Check for changed rules, every few seconds at most.
        let now = Instant::now();
        let recheck = self
            .last_config_check
            .map_or(true, |at| now.duration_since(at) > CONFIG_RECHECK);
        if recheck {
            if self
                .rules
                .as_ref()
                .is_some_and(RulesIndex::check_timestamp)
            {
                info!("rules changed, reloading");
                self.reload();
            }
            self.last_config_check = Some(now);
        }

        self.idle_cleanup_at = None;

        if self.rules.is_none() {
            match RulesIndex::load(self.engine.config().resolve_names) {
                Ok(rules) => self.rules = Some(rules),
                Err(err) => {
                    error!(error = %err, "failed to read rules");
                    return;
                }
            }
        }

        self.engine.run_queue(&mut self.spawner);
    }

    /// Reload: drop cached rules, restart workers, keep the queue.
    fn reload(&mut self) {
        self.notify.reloading("Flushing configuration...");
        self.engine.kill_workers(&mut self.spawner);
        self.rules = None;
        self.notify.ready(&format!(
            "Processing with {} children at max",
            self.engine.config().children_max()
        ));
    }

    /// Begin graceful shutdown.
    fn begin_shutdown(&mut self) {
        if self.engine.exiting() {
            return;
        }
        info!("starting shutdown");
        self.engine.begin_exit();
        self.notify.stopping("Starting shutdown...");

        // Close sources of new events: control, uevent, inotify, in that
        // order. Buffered events are discarded with them.
        self.sources.ctrl = None;
        self.sources.monitor = None;
        self.sources.watches = None;

        self.engine.cleanup_queue(EventFilter::Queued);
        self.engine.kill_workers(&mut self.spawner);
        self.exit_deadline_at = Some(Instant::now() + EXIT_GRACE);
    }

    /// Post-iteration hook; returns `true` when the loop should terminate.
    fn post(&mut self) -> bool {
        if !self.engine.queue().is_empty() {
            return false;
        }

        if !self.engine.pool().is_empty() {
            // No pending events but live workers: arm the idle cleanup.
            self.idle_cleanup_at = Some(Instant::now() + IDLE_WORKER_CLEANUP);
            return false;
        }

        if self.engine.exiting() {
            if self.ctrl_conn_blocking.is_some() {
                // Dropping the held connection is the EXIT acknowledgment.
                debug!("releasing blocked control client");
            }
            return true;
        }

        if let Some(cgroup) = &self.cgroup {
            // Clean up possible left-over processes in our cgroup.
            cgroup::kill_stray_members(cgroup);
        }
        false
    }
}

/// Await readability of an optional source; absent sources never wake.
async fn readable_opt<T: AsRawFd>(fd: Option<&AsyncFd<T>>) {
    match fd {
        Some(fd) => {
            let _ = fd.readable().await;
        }
        None => std::future::pending().await,
    }
}

/// Receive one worker acknowledgment, enforcing frame size and sender
/// credentials. `Ok(None)` means the frame was dropped.
fn recv_ack(fd: &OwnedFd) -> io::Result<Option<Pid>> {
    let mut buf = [0u8; 16];
    let mut cmsg_buf = nix::cmsg_space!(UnixCredentials);
    let mut iov = [IoSliceMut::new(&mut buf)];

    let msg = recvmsg::<UnixAddr>(
        fd.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    let mut credentials: Option<UnixCredentials> = None;
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
            credentials = Some(creds);
        }
    }

    if msg.bytes != ACK_MESSAGE.len() {
        warn!(size = msg.bytes, "ignoring worker message with invalid size");
        return Ok(None);
    }
    let Some(credentials) = credentials.filter(|c| c.pid() > 0) else {
        warn!("ignoring worker message without valid credentials");
        return Ok(None);
    };
    Ok(Some(Pid::from_raw(credentials.pid())))
}

/// Map a `waitpid` status onto the engine's exit classification.
fn classify_wait_status(status: WaitStatus) -> Option<(Pid, ExitKind)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((Pid::from_raw(pid.as_raw()), ExitKind::Exited(code))),
        WaitStatus::Signaled(pid, sig, _) => {
            Some((Pid::from_raw(pid.as_raw()), ExitKind::Signaled(sig as i32)))
        }
        WaitStatus::Stopped(pid, _) => Some((Pid::from_raw(pid.as_raw()), ExitKind::Stopped)),
        WaitStatus::Continued(pid) => Some((Pid::from_raw(pid.as_raw()), ExitKind::Continued)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::send;

    #[test]
    fn test_classify_wait_status() {
        let pid = nix::unistd::Pid::from_raw(1234);
        assert_eq!(
            classify_wait_status(WaitStatus::Exited(pid, 1)),
            Some((Pid::from_raw(1234), ExitKind::Exited(1)))
        );
        assert_eq!(
            classify_wait_status(WaitStatus::Signaled(pid, nix::sys::signal::Signal::SIGKILL, false)),
            Some((Pid::from_raw(1234), ExitKind::Signaled(9)))
        );
        assert_eq!(classify_wait_status(WaitStatus::StillAlive), None);
    }

    /// Acks are only attributed to a sender the kernel vouches for; an
    /// oversized frame is dropped before the credentials even matter.
    #[test]
    fn test_recv_ack_enforces_frame_size() {
        let (rx, tx) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        setsockopt(&rx, sockopt::PassCred, &true).unwrap();
        crate::set_nonblocking(&rx).unwrap();

        send(tx.as_raw_fd(), b"oversized frame", MsgFlags::empty()).unwrap();
        assert_eq!(recv_ack(&rx).unwrap(), None);

        // A well-formed ack resolves to the sender's (our own) pid.
        send(tx.as_raw_fd(), &ACK_MESSAGE, MsgFlags::empty()).unwrap();
        let pid = recv_ack(&rx).unwrap().expect("credentialed ack");
        assert_eq!(pid.as_raw(), std::process::id() as i32);

        // Drained: the socket reports would-block.
        let err = recv_ack(&rx).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
