// Durable record of the proxy process tracked across launcher invocations.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

use crate::fs::{write_atomic, AtomicWriteOptions};
use crate::process_utils::{pid_in_range, process_exists, read_cmdline, read_proc_stat};

/// Process record persisted once the proxy is ready. Never mutated after writing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedProcess {
    pub pid: u32,
    /// Substring expected in the live process's command line.
    pub command_fragment: String,
    pub started_at: DateTime<Utc>,
    pub port: u16,
    /// Launcher that spawned the process; `None` for records of unknown origin.
    #[serde(default)]
    pub owner_pid: Option<u32>,
    /// `/proc/[pid]/stat` starttime captured at spawn, when available.
    #[serde(default)]
    pub start_ticks: Option<u64>,
}

impl TrackedProcess {
    /// Record for a process spawned by the current launcher.
    pub fn new(pid: u32, command_fragment: impl Into<String>, port: u16) -> Self {
        Self {
            pid,
            command_fragment: command_fragment.into(),
            started_at: Utc::now(),
            port,
            owner_pid: Some(std::process::id()),
            start_ticks: read_proc_stat(pid).ok().map(|stat| stat.starttime),
        }
    }

    /// True while the launcher that spawned this process is still running.
    pub fn owner_alive(&self) -> bool {
        self.owner_pid.map(process_exists).unwrap_or(false)
    }

    fn is_well_formed(&self) -> bool {
        pid_in_range(self.pid) && !self.command_fragment.trim().is_empty()
    }
}

/// Single-slot registry file plus its advisory lock file.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    path: PathBuf,
}

/// Exclusive advisory lock on the registry; released on drop.
#[derive(Debug)]
pub struct RegistryLock {
    file: File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ProcessRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Persist `record`, replacing any previous one atomically (0700 dir, 0600 file).
    pub fn write(&self, record: &TrackedProcess) -> io::Result<()> {
        let payload = serde_json::to_vec_pretty(record).map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to serialize registry record: {}", e),
            )
        })?;
        write_atomic(&self.path, &payload, AtomicWriteOptions::private())?;
        debug!(pid = record.pid, port = record.port, path = %self.path.display(), "registry record written");
        Ok(())
    }

    /// Load the record. Missing or malformed files read as `None`.
    pub fn read(&self) -> Option<TrackedProcess> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), "Failed to read registry: {}", err);
                return None;
            }
        };

        match serde_json::from_slice::<TrackedProcess>(&bytes) {
            Ok(record) if record.is_well_formed() => Some(record),
            Ok(record) => {
                warn!(pid = record.pid, path = %self.path.display(), "Ignoring malformed registry record");
                None
            }
            Err(err) => {
                warn!(path = %self.path.display(), "Ignoring unparsable registry: {}", err);
                None
            }
        }
    }

    /// The PID must exist, must not be a zombie, and its command line must contain
    /// the recorded fragment. A reused PID with a different command line is not ours.
    pub fn is_live(&self, record: &TrackedProcess) -> bool {
        if !record.is_well_formed() || !process_exists(record.pid) {
            return false;
        }

        let cmdline = match read_cmdline(record.pid) {
            Ok(cmdline) => cmdline,
            Err(err) => {
                debug!(pid = record.pid, "cmdline unavailable: {}", err);
                return false;
            }
        };
        if !cmdline.contains(&record.command_fragment) {
            debug!(
                pid = record.pid,
                fragment = %record.command_fragment,
                "PID reused by an unrelated process"
            );
            return false;
        }

        if let (Some(expected), Ok(stat)) = (record.start_ticks, read_proc_stat(record.pid)) {
            if stat.starttime != expected {
                debug!(pid = record.pid, "PID reused (start_ticks mismatch)");
                return false;
            }
        }

        true
    }

    /// Remove the record. Missing files are not an error.
    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "registry record cleared");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Non-blocking exclusive lock. `Ok(None)` when another invocation holds it.
    pub fn try_lock(&self) -> io::Result<Option<RegistryLock>> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            create_private_dir(parent)?;
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(target_family = "unix")]
        options.mode(0o600);
        let file = options.open(&lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RegistryLock { file })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(target_family = "unix")]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .mode(0o700)
        .recursive(true)
        .create(dir)
}

#[cfg(not(target_family = "unix"))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}
