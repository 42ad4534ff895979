//! Lifecycle of the single proxy child process.
//!
//! A [`ProcessSupervisor`] spawns the proxy in its own session, waits for its TCP
//! port to accept connections, records it in the [`ProcessRegistry`], and tears it
//! down again with graceful→forced escalation.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use relay_common::process_registry::{ProcessRegistry, TrackedProcess};

use crate::error::{SupervisorError, SupervisorResult};
use crate::terminate::{terminate, TerminationOutcome};

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

pub const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

/// Program, argument vector and environment of the proxy. Never passed through a shell.
///
/// Arguments may contain `{port}` and `{host}`; they are substituted at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub host: String,
    fragment: Option<String>,
}

impl ProxyCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            host: DEFAULT_HOST.to_string(),
            fragment: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Override the command-line fragment used to recognise the running proxy.
    pub fn fragment(mut self, fragment: impl Into<String>) -> Self {
        let fragment = fragment.into();
        self.fragment = (!fragment.trim().is_empty()).then_some(fragment);
        self
    }

    /// Explicit fragment, else the program's file name.
    pub fn command_fragment(&self) -> String {
        if let Some(fragment) = &self.fragment {
            return fragment.clone();
        }
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    pub fn rendered_args(&self, port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{host}", &self.host)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub log_tail_lines: usize,
    /// Grace period used by [`ProcessSupervisor::shutdown`].
    pub stop_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(250),
            log_tail_lines: 20,
            stop_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ProcessSupervisor {
    registry: ProcessRegistry,
    log_path: PathBuf,
    options: SupervisorOptions,
    state: SupervisorState,
    child: Option<Child>,
    pid: Option<u32>,
}

impl ProcessSupervisor {
    pub fn new(registry: ProcessRegistry, log_path: impl Into<PathBuf>) -> Self {
        Self::with_options(registry, log_path, SupervisorOptions::default())
    }

    pub fn with_options(
        registry: ProcessRegistry,
        log_path: impl Into<PathBuf>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            registry,
            log_path: log_path.into(),
            options,
            state: SupervisorState::Idle,
            child: None,
            pid: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Pid of the process this supervisor spawned, if any.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Spawn `command` and wait until `readiness_port` accepts TCP connections.
    ///
    /// The registry lock is held from the liveness check until the record is
    /// written, so two launchers cannot both decide the slot is free.
    pub async fn start(
        &mut self,
        command: &ProxyCommand,
        readiness_port: u16,
        startup_timeout: Duration,
    ) -> SupervisorResult<u32> {
        if self.state != SupervisorState::Idle {
            return Err(SupervisorError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        let _lock = self
            .registry
            .try_lock()?
            .ok_or(SupervisorError::AlreadyRunning {
                pid: None,
                port: None,
            })?;

        if let Some(existing) = self.registry.read() {
            if self.registry.is_live(&existing) {
                return Err(SupervisorError::AlreadyRunning {
                    pid: Some(existing.pid),
                    port: Some(existing.port),
                });
            }
            info!(pid = existing.pid, "clearing stale proxy record");
            self.registry.clear()?;
        }

        let log_offset = self.spawn(command, readiness_port)?;
        let pid = self.pid.unwrap_or_default();
        info!(
            pid,
            port = readiness_port,
            program = %command.program.display(),
            "proxy spawned, waiting for readiness"
        );

        let deadline = Instant::now() + startup_timeout;
        loop {
            if let Some(status) = self.try_wait_child() {
                self.state = SupervisorState::Failed;
                self.child = None;
                let log_tail = self.log_tail(log_offset);
                warn!(pid, %status, "proxy exited during startup");
                return Err(SupervisorError::ExitedDuringStartup { status, log_tail });
            }

            if self.probe(&command.host, readiness_port).await {
                break;
            }

            if Instant::now() >= deadline {
                self.state = SupervisorState::Failed;
                self.kill_child().await;
                let log_tail = self.log_tail(log_offset);
                warn!(
                    pid,
                    port = readiness_port,
                    "proxy not ready within {}s",
                    startup_timeout.as_secs_f64()
                );
                return Err(SupervisorError::StartupTimeout {
                    port: readiness_port,
                    timeout: startup_timeout,
                    log_tail,
                });
            }

            sleep(self.options.poll_interval).await;
        }

        let record = TrackedProcess::new(pid, command.command_fragment(), readiness_port);
        if let Err(err) = self.registry.write(&record) {
            self.state = SupervisorState::Failed;
            self.kill_child().await;
            return Err(err.into());
        }

        self.state = SupervisorState::Ready;
        info!(pid, port = readiness_port, "proxy ready");
        Ok(pid)
    }

    /// Stop a ready process and clear its registry record.
    pub async fn stop(&mut self, pid: u32, stop_timeout: Duration) -> SupervisorResult<()> {
        if self.state != SupervisorState::Ready {
            return Err(SupervisorError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }
        self.state = SupervisorState::Stopping;
        self.terminate_and_forget(pid, stop_timeout).await
    }

    /// Stop whatever this supervisor spawned. No-op when nothing is running.
    pub async fn shutdown(&mut self) -> SupervisorResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match self.state {
            SupervisorState::Ready => self.stop(pid, self.options.stop_timeout).await,
            SupervisorState::Starting => {
                debug!(pid, "shutting down proxy that never became ready");
                self.state = SupervisorState::Stopping;
                self.terminate_and_forget(pid, self.options.stop_timeout)
                    .await
            }
            _ => Ok(()),
        }
    }

    fn spawn(&mut self, command: &ProxyCommand, port: u16) -> SupervisorResult<u64> {
        let (log, offset) = open_log(&self.log_path)?;
        let stderr_log = log.try_clone()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(command.rendered_args(port))
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(false);

        // Own session: the terminal's SIGINT does not reach the proxy and
        // the whole group can be signalled at teardown.
        #[cfg(target_family = "unix")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;

        self.pid = child.id();
        self.child = Some(child);
        self.state = SupervisorState::Starting;
        Ok(offset)
    }

    async fn probe(&self, host: &str, port: u16) -> bool {
        matches!(
            timeout(self.options.connect_timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    fn try_wait_child(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(err) => {
                debug!("try_wait failed: {}", err);
                None
            }
        }
    }

    async fn kill_child(&mut self) {
        if let Some(pid) = self.pid {
            if let Err(err) = terminate(pid, Duration::ZERO, self.child.as_mut()).await {
                warn!(pid, "failed to kill proxy: {}", err);
            }
        }
        self.child = None;
    }

    async fn terminate_and_forget(&mut self, pid: u32, stop_timeout: Duration) -> SupervisorResult<()> {
        let child = if self.pid == Some(pid) {
            self.child.as_mut()
        } else {
            None
        };

        match terminate(pid, stop_timeout, child).await {
            Ok(outcome) => {
                if outcome == TerminationOutcome::Forced {
                    warn!(pid, "proxy required SIGKILL");
                }
                self.state = SupervisorState::Stopped;
                if self.pid == Some(pid) {
                    self.child = None;
                }
                if self.registry.read().map(|r| r.pid) == Some(pid) {
                    self.registry.clear()?;
                }
                info!(pid, ?outcome, "proxy stopped");
                Ok(())
            }
            Err(err) => {
                self.state = SupervisorState::Failed;
                Err(err)
            }
        }
    }

    fn log_tail(&self, offset: u64) -> Vec<String> {
        read_log_tail(&self.log_path, offset, self.options.log_tail_lines).unwrap_or_else(|err| {
            debug!(path = %self.log_path.display(), "proxy log unreadable: {}", err);
            Vec::new()
        })
    }
}

/// Open the proxy log for appending; returns the handle and the current length.
fn open_log(path: &Path) -> io::Result<(std::fs::File, u64)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(target_family = "unix")]
        builder.mode(0o700);
        builder.create(parent)?;
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(target_family = "unix")]
    options.mode(0o600);
    let file = options.open(path)?;
    let offset = file.metadata()?.len();
    Ok((file, offset))
}

/// Last `lines` lines written to `path` after byte `offset`.
pub fn read_log_tail(path: &Path, offset: u64, lines: usize) -> io::Result<Vec<String>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;

    let text = String::from_utf8_lossy(&raw);
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|line| line.to_string()).collect())
}
