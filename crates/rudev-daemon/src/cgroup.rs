//! Leftover-process cleanup within the daemon's cgroup.
//!
//! When spawned directly by the init process the daemon sits in a dedicated
//! cgroup. Workers occasionally leave helper processes behind; whenever the
//! queue and the pool are both empty the manager sweeps the cgroup and
//! SIGKILLs anything that is not the daemon itself.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// The daemon's unified-hierarchy cgroup path, if it has a dedicated one.
#[must_use]
pub fn current_cgroup() -> Option<String> {
    let content = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    parse_cgroup(&content)
}

/// Extract the unified-hierarchy path from `/proc/self/cgroup` content.
#[must_use]
pub fn parse_cgroup(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let path = line.strip_prefix("0::")?;
        (path != "/").then(|| path.to_string())
    })
}

/// SIGKILL every process in the cgroup except the daemon itself.
pub fn kill_stray_members(cgroup: &str) {
    let procs = format!("/sys/fs/cgroup{cgroup}/cgroup.procs");
    let content = match std::fs::read_to_string(&procs) {
        Ok(content) => content,
        Err(err) => {
            debug!(path = %procs, error = %err, "could not read cgroup members");
            return;
        }
    };

    let own_pid = std::process::id();
    for line in content.lines() {
        let Ok(pid) = line.trim().parse::<i32>() else {
            continue;
        };
        if pid <= 1 || pid == own_pid as i32 {
            continue;
        }
        debug!(pid, "killing stray process left in cgroup");
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
            warn!(pid, error = %err, "failed to kill stray process");
        }
    }
}
