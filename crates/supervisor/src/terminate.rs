// Graceful then forced termination of a process (or the group it leads).

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use relay_common::process_utils::{is_group_leader, pid_in_range, process_exists};

use crate::error::{SupervisorError, SupervisorResult};

const GRACE_POLL: Duration = Duration::from_millis(500);
const FORCED_WAIT: Duration = Duration::from_secs(1);
const FORCED_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Gone before any signal was sent.
    AlreadyExited,
    /// Exited after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Forced,
}

/// SIGTERM, poll every 0.5 s for `timeout`, then SIGKILL and poll for up to 1 s.
///
/// Signals go to the process group when `pid` leads one, so helpers the process
/// spawned go down with it. `child` is reaped when given; other pids are probed
/// with `kill(pid, 0)` and zombies count as exited. A target that refuses
/// signals (EPERM) fails right away instead of being polled.
pub async fn terminate(
    pid: u32,
    timeout: Duration,
    mut child: Option<&mut Child>,
) -> SupervisorResult<TerminationOutcome> {
    if !pid_in_range(pid) || !is_alive(pid, child.as_deref_mut()) {
        return Ok(TerminationOutcome::AlreadyExited);
    }

    let group = is_group_leader(pid);
    debug!(pid, group, "sending SIGTERM");
    match send(pid, group, Signal::SIGTERM) {
        Delivery::Sent => {}
        Delivery::Gone => return Ok(TerminationOutcome::AlreadyExited),
        Delivery::Denied => return Err(SupervisorError::Termination { pid }),
    }

    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid, child.as_deref_mut()) {
            info!(pid, "process exited after SIGTERM");
            return Ok(TerminationOutcome::Graceful);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep(GRACE_POLL.min(deadline - now)).await;
    }

    warn!(pid, timeout_secs = timeout.as_secs_f64(), "process ignored SIGTERM, sending SIGKILL");
    if send(pid, group, Signal::SIGKILL) == Delivery::Denied {
        return Err(SupervisorError::Termination { pid });
    }

    let deadline = Instant::now() + FORCED_WAIT;
    loop {
        if !is_alive(pid, child.as_deref_mut()) {
            return Ok(TerminationOutcome::Forced);
        }
        if Instant::now() >= deadline {
            return Err(SupervisorError::Termination { pid });
        }
        sleep(FORCED_POLL).await;
    }
}

fn is_alive(pid: u32, child: Option<&mut Child>) -> bool {
    if let Some(child) = child {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, %status, "child reaped");
                return false;
            }
            Ok(None) => return true,
            Err(err) => debug!(pid, "try_wait failed, probing pid: {}", err),
        }
    }
    process_exists(pid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// The target no longer exists.
    Gone,
    /// The target exists but cannot be signalled (EPERM and other errors).
    Denied,
}

fn send(pid: u32, group: bool, signal: Signal) -> Delivery {
    let target = Pid::from_raw(pid as i32);
    let result = if group {
        killpg(target, signal)
    } else {
        kill(target, signal)
    };
    let delivery = delivery(result);
    if let (Delivery::Denied, Err(err)) = (delivery, result) {
        warn!(pid, ?signal, "failed to signal process: {}", err);
    }
    delivery
}

fn delivery(result: nix::Result<()>) -> Delivery {
    match result {
        Ok(()) => Delivery::Sent,
        Err(Errno::ESRCH) => Delivery::Gone,
        Err(_) => Delivery::Denied,
    }
}
