use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::supervisor::SupervisorState;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The process never accepted a connection on its port.
    #[error("Proxy did not accept connections on port {port} within {}s", timeout.as_secs())]
    StartupTimeout {
        port: u16,
        timeout: Duration,
        log_tail: Vec<String>,
    },

    #[error("Proxy exited during startup ({status})")]
    ExitedDuringStartup { status: String, log_tail: Vec<String> },

    /// Still alive after SIGKILL and the forced wait.
    #[error("Process {pid} is still alive after SIGKILL")]
    Termination { pid: u32 },

    #[error("{}", already_running_message(*pid, *port))]
    AlreadyRunning { pid: Option<u32>, port: Option<u16> },

    #[error("No free TCP port in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("Cannot {operation} while supervisor is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SupervisorState,
    },

    #[error("Process registry error: {0}")]
    Registry(#[from] io::Error),
}

impl SupervisorError {
    /// Proxy log lines captured when startup failed.
    pub fn log_tail(&self) -> &[String] {
        match self {
            SupervisorError::StartupTimeout { log_tail, .. }
            | SupervisorError::ExitedDuringStartup { log_tail, .. } => log_tail,
            _ => &[],
        }
    }
}

fn already_running_message(pid: Option<u32>, port: Option<u16>) -> String {
    match (pid, port) {
        (Some(pid), Some(port)) => {
            format!("A proxy is already running (pid {}, port {})", pid, port)
        }
        (Some(pid), None) => format!("A proxy is already running (pid {})", pid),
        _ => "Another launcher is starting a proxy right now".to_string(),
    }
}
