// Cleanup of proxies left behind by launchers that died without tearing down.

use std::time::Duration;

use tracing::{debug, info, warn};

use relay_common::process_registry::ProcessRegistry;
use relay_common::process_utils::{ancestors, list_processes, process_uid};

use crate::terminate::terminate;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Pids terminated, registry orphan first.
    pub terminated: Vec<u32>,
    /// Pid of a stale record removed without signalling.
    pub stale_cleared: Option<u32>,
    /// Pid left alone because its launcher is still running.
    pub protected: Option<u32>,
    /// True when another launcher held the registry lock and the process table was not scanned.
    pub table_scan_skipped: bool,
    pub failures: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pass 1 handles the registry record; pass 2 scans the process table for
/// untracked processes whose command line contains `signature`.
///
/// Failures end up in the report and are never raised.
pub async fn sweep_orphans(
    registry: &ProcessRegistry,
    signature: &str,
    stop_timeout: Duration,
) -> SweepReport {
    let mut report = SweepReport::default();

    let lock = match registry.try_lock() {
        Ok(lock) => lock,
        Err(err) => {
            report
                .failures
                .push(format!("registry lock unavailable: {}", err));
            None
        }
    };

    let handled = sweep_registry(registry, stop_timeout, &mut report).await;

    if lock.is_none() {
        debug!("registry lock busy, skipping process table scan");
        report.table_scan_skipped = true;
        return report;
    }
    if signature.trim().is_empty() {
        debug!("empty signature, skipping process table scan");
        return report;
    }

    let me = std::process::id();
    // Wrappers that started this launcher may carry the signature in their arguments.
    let mut spared = ancestors(me);
    spared.push(me);
    spared.extend(handled);
    let uid = nix::unistd::getuid().as_raw();
    let processes = match list_processes() {
        Ok(processes) => processes,
        Err(err) => {
            report
                .failures
                .push(format!("process table unavailable: {}", err));
            return report;
        }
    };

    for process in processes {
        if spared.contains(&process.pid) || !process.cmdline.contains(signature) {
            continue;
        }
        if process_uid(process.pid).is_ok_and(|owner| owner != uid) {
            debug!(pid = process.pid, "skipping process owned by another user");
            continue;
        }
        info!(pid = process.pid, cmdline = %process.cmdline, "terminating untracked proxy");
        match terminate(process.pid, stop_timeout, None).await {
            Ok(_) => report.terminated.push(process.pid),
            Err(err) => {
                warn!(pid = process.pid, "sweep failed: {}", err);
                report.failures.push(err.to_string());
            }
        }
    }

    drop(lock);
    report
}

/// Returns the pid the record referred to, so pass 2 leaves it alone.
async fn sweep_registry(
    registry: &ProcessRegistry,
    stop_timeout: Duration,
    report: &mut SweepReport,
) -> Option<u32> {
    let Some(record) = registry.read() else {
        // absent, or malformed and already logged by `read`
        clear(registry, report);
        return None;
    };

    if !registry.is_live(&record) {
        debug!(pid = record.pid, "purging stale registry record");
        clear(registry, report);
        report.stale_cleared = Some(record.pid);
        return Some(record.pid);
    }

    if record.owner_alive() {
        debug!(
            pid = record.pid,
            owner = ?record.owner_pid,
            "proxy still owned by a running launcher"
        );
        report.protected = Some(record.pid);
        return Some(record.pid);
    }

    info!(pid = record.pid, port = record.port, "terminating orphaned proxy");
    match terminate(record.pid, stop_timeout, None).await {
        Ok(_) => {
            report.terminated.push(record.pid);
            clear(registry, report);
        }
        Err(err) => {
            warn!(pid = record.pid, "orphan survived termination: {}", err);
            report.failures.push(err.to_string());
        }
    }
    Some(record.pid)
}

fn clear(registry: &ProcessRegistry, report: &mut SweepReport) {
    if let Err(err) = registry.clear() {
        warn!(path = %registry.path().display(), "failed to clear registry: {}", err);
        report
            .failures
            .push(format!("failed to clear registry: {}", err));
    }
}
