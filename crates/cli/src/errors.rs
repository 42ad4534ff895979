//! # Launcher error taxonomy
//!
//! Every failure that reaches `main` is a [`LaunchError`]. Each variant maps to
//! a stable process exit code, a machine-readable error code and an optional
//! hint printed under the message.

use std::borrow::Cow;
use std::io;

use thiserror::Error;

use relay_catalog::CatalogError;
use relay_supervisor::SupervisorError;

pub type LaunchResult<T> = Result<T, LaunchError>;

/// Process exit codes of the `launch` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Failure = 1,
    DependencyMissing = 2,
    Configuration = 3,
    Network = 4,
    UpstreamApi = 5,
    Cancelled = 6,
    ProxyStartup = 7,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    /// E_DEPENDENCY_MISSING - a required program is not on PATH
    #[error("Required program '{program}' was not found")]
    DependencyMissing { program: String },

    /// E_CONFIGURATION - invalid configuration, selection or missing credentials
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// E_NETWORK - catalog unreachable and nothing cached
    #[error("Network error: {0}")]
    Network(String),

    /// E_UPSTREAM_API - catalog server answered with an error status
    #[error("Upstream API error: {0}")]
    UpstreamApi(String),

    /// E_CATALOG_INVALID - catalog document failed validation
    #[error("Invalid catalog: {0}")]
    CatalogValidation(String),

    /// E_CANCELLED - selection cancelled or interrupted by a signal
    #[error("Cancelled by user")]
    UserCancelled,

    /// E_PROXY_STARTUP - the proxy could not be started
    #[error("Proxy startup failed: {message}")]
    ProxyStartup {
        message: String,
        log_tail: Vec<String>,
    },

    /// E_TERMINATION - a process survived SIGKILL
    #[error("Process {pid} could not be terminated")]
    ProcessTermination { pid: u32 },

    /// E_ALREADY_RUNNING - another launcher owns the proxy slot
    #[error("{0}")]
    AlreadyRunning(String),

    /// E_IO
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// E_INTERNAL
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LaunchError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            LaunchError::DependencyMissing { .. } => ExitCode::DependencyMissing,
            LaunchError::Configuration(_) => ExitCode::Configuration,
            LaunchError::Network(_) => ExitCode::Network,
            LaunchError::UpstreamApi(_) | LaunchError::CatalogValidation(_) => {
                ExitCode::UpstreamApi
            }
            LaunchError::UserCancelled => ExitCode::Cancelled,
            LaunchError::ProxyStartup { .. } | LaunchError::AlreadyRunning(_) => {
                ExitCode::ProxyStartup
            }
            LaunchError::ProcessTermination { .. }
            | LaunchError::Io(_)
            | LaunchError::Internal(_) => ExitCode::Failure,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            LaunchError::DependencyMissing { .. } => "E_DEPENDENCY_MISSING",
            LaunchError::Configuration(_) => "E_CONFIGURATION",
            LaunchError::Network(_) => "E_NETWORK",
            LaunchError::UpstreamApi(_) => "E_UPSTREAM_API",
            LaunchError::CatalogValidation(_) => "E_CATALOG_INVALID",
            LaunchError::UserCancelled => "E_CANCELLED",
            LaunchError::ProxyStartup { .. } => "E_PROXY_STARTUP",
            LaunchError::ProcessTermination { .. } => "E_TERMINATION",
            LaunchError::AlreadyRunning(_) => "E_ALREADY_RUNNING",
            LaunchError::Io(_) => "E_IO",
            LaunchError::Internal(_) => "E_INTERNAL",
        }
    }

    pub fn hint(&self) -> Option<Cow<'static, str>> {
        match self {
            LaunchError::DependencyMissing { program } => Some(Cow::Owned(format!(
                "Install '{}' or point the config at its full path",
                program
            ))),
            LaunchError::Configuration(_) => Some(Cow::Borrowed(
                "Check relay.toml, RELAY_CONFIG and the AUTO_SELECT_PROVIDER/RELAY_* variables",
            )),
            LaunchError::Network(_) => Some(Cow::Borrowed(
                "Check connectivity or set RELAY_CATALOG_URL to a reachable catalog",
            )),
            LaunchError::UpstreamApi(_) | LaunchError::CatalogValidation(_) => Some(
                Cow::Borrowed("The catalog server returned unusable data; retry later"),
            ),
            LaunchError::ProxyStartup { .. } => Some(Cow::Borrowed(
                "Inspect the proxy log or raise PROXY_STARTUP_TIMEOUT",
            )),
            LaunchError::AlreadyRunning(_) => Some(Cow::Borrowed(
                "Another launch session is active; wait for it to exit",
            )),
            _ => None,
        }
    }

    pub fn log_tail(&self) -> &[String] {
        match self {
            LaunchError::ProxyStartup { log_tail, .. } => log_tail,
            _ => &[],
        }
    }
}

impl From<CatalogError> for LaunchError {
    fn from(err: CatalogError) -> Self {
        let message = err.to_string();
        match err.root_cause() {
            CatalogError::Network { .. } => LaunchError::Network(message),
            CatalogError::Status { .. } => LaunchError::UpstreamApi(message),
            CatalogError::Validation(_) => LaunchError::CatalogValidation(message),
            CatalogError::Io(_) | CatalogError::Unavailable { .. } => LaunchError::Internal(message),
        }
    }
}

impl From<SupervisorError> for LaunchError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::AlreadyRunning { .. } => LaunchError::AlreadyRunning(err.to_string()),
            SupervisorError::Termination { pid } => LaunchError::ProcessTermination { pid },
            SupervisorError::Registry(source) => LaunchError::Io(source),
            other => LaunchError::ProxyStartup {
                message: other.to_string(),
                log_tail: other.log_tail().to_vec(),
            },
        }
    }
}
