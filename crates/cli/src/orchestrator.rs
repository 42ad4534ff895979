//! # Launch state machine
//!
//! `Init → Sweep → CatalogLoaded → Selecting → ProxyStarting → Launched`, with
//! `Aborted` on cancellation and `Failed` on any other error. Native providers
//! skip `ProxyStarting`. Every transition is recorded in [`LaunchOrchestrator::history`].
//!
//! Long-running steps race the [`CleanupGuard`] token, so a signal aborts the
//! current stage. Teardown itself is left to the guard's finalizers, which
//! `main` runs on every exit path.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use relay_catalog::{
    select_preferred, CatalogCache, CatalogOrigin, CatalogQuery, Model, ProviderEntry,
    SelectionFilter,
};
use relay_common::{ProcessRegistry, RelayPaths};
use relay_supervisor::{
    find_free_port, sweep_orphans, ProcessSupervisor, SupervisorOptions,
};

use crate::cleanup::{CleanupGuard, Finalizer};
use crate::config::{HandoffMode, LaunchConfig};
use crate::deps::resolve_program;
use crate::errors::{LaunchError, LaunchResult};
use crate::plan::{AssistantPlan, LaunchPlan, ProxyPlan, Secret};
use crate::selector::{Choice, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    Init,
    Sweep,
    CatalogLoaded,
    Selecting,
    ProxyStarting,
    Launched,
    Aborted,
    Failed,
}

/// Per-invocation inputs from the command line.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Overrides the configured filter.
    pub filter: Option<SelectionFilter>,
    pub dry_run: bool,
    /// Appended verbatim to the assistant's command line.
    pub assistant_args: Vec<String>,
}

#[derive(Debug)]
pub enum LaunchOutcome {
    DryRun(LaunchPlan),
    /// The assistant ran and exited with `code`.
    Exited { code: i32 },
}

/// Stops the proxy during cleanup.
struct ProxyFinalizer {
    supervisor: Arc<Mutex<ProcessSupervisor>>,
}

#[async_trait]
impl Finalizer for ProxyFinalizer {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn finalize(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if let Err(err) = supervisor.shutdown().await {
            warn!("proxy shutdown failed: {}", err);
        }
    }
}

pub struct LaunchOrchestrator<S> {
    config: LaunchConfig,
    paths: RelayPaths,
    /// Taken while a prompt runs on the blocking pool.
    selector: Option<S>,
    cleanup: Arc<CleanupGuard>,
    supervisor: Arc<Mutex<ProcessSupervisor>>,
    stage: LaunchStage,
    history: Vec<LaunchStage>,
}

impl<S: Selector + 'static> LaunchOrchestrator<S> {
    pub fn new(
        config: LaunchConfig,
        paths: RelayPaths,
        selector: S,
        cleanup: Arc<CleanupGuard>,
    ) -> Self {
        let options = SupervisorOptions {
            stop_timeout: config.stop_timeout(),
            ..SupervisorOptions::default()
        };
        let supervisor = ProcessSupervisor::with_options(
            ProcessRegistry::new(paths.registry.clone()),
            paths.proxy_log.clone(),
            options,
        );

        Self {
            config,
            paths,
            selector: Some(selector),
            cleanup,
            supervisor: Arc::new(Mutex::new(supervisor)),
            stage: LaunchStage::Init,
            history: vec![LaunchStage::Init],
        }
    }

    pub fn stage(&self) -> LaunchStage {
        self.stage
    }

    pub fn history(&self) -> &[LaunchStage] {
        &self.history
    }

    pub fn selector(&self) -> Option<&S> {
        self.selector.as_ref()
    }

    pub fn supervisor(&self) -> Arc<Mutex<ProcessSupervisor>> {
        Arc::clone(&self.supervisor)
    }

    pub async fn run(&mut self, request: LaunchRequest) -> LaunchResult<LaunchOutcome> {
        match self.execute(&request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let terminal = if matches!(err, LaunchError::UserCancelled) {
                    LaunchStage::Aborted
                } else {
                    LaunchStage::Failed
                };
                debug!(stage = ?self.stage, error = %err, "launch stopped");
                self.transition(terminal);
                Err(err)
            }
        }
    }

    fn transition(&mut self, next: LaunchStage) {
        debug!(from = ?self.stage, to = ?next, "launch stage");
        self.stage = next;
        self.history.push(next);
    }

    async fn execute(&mut self, request: &LaunchRequest) -> LaunchResult<LaunchOutcome> {
        let token = self.cleanup.token();
        let dry_run = request.dry_run;
        let filter = match request.filter {
            Some(filter) => filter,
            None => self.config.filter().map_err(LaunchError::Configuration)?,
        };

        let assistant_program = check_dependency(&self.config.assistant.program, dry_run)?;

        self.transition(LaunchStage::Sweep);
        if dry_run {
            info!("dry run: skipping orphan sweep");
        } else {
            let registry = ProcessRegistry::new(self.paths.registry.clone());
            let fragment = self.config.proxy_fragment();
            let report = until_cancelled(
                &token,
                sweep_orphans(&registry, &fragment, self.config.stop_timeout()),
            )
            .await?;
            if !report.terminated.is_empty() {
                info!(pids = ?report.terminated, "terminated orphaned proxies");
            }
            for failure in &report.failures {
                warn!("orphan sweep: {}", failure);
            }
        }

        let cache = CatalogCache::new(&self.config.catalog.url, &self.paths.catalog_cache)
            .with_ttl(self.config.catalog_ttl())
            .with_fetch_timeout(self.config.fetch_timeout());
        let envelope = until_cancelled(&token, cache.load()).await??;
        match &envelope.origin {
            CatalogOrigin::StaleFallback { reason } => {
                warn!("using stale catalog from {}: {}", envelope.fetched_at, reason)
            }
            origin => debug!(?origin, providers = envelope.catalog.providers.len(), "catalog loaded"),
        }
        self.transition(LaunchStage::CatalogLoaded);

        self.transition(LaunchStage::Selecting);
        let query = CatalogQuery::new(&envelope.catalog);
        let provider = self.resolve_provider(&query, request, filter).await?;
        let model = self.resolve_model(&query, &provider, request, filter).await?;
        validate_base_url(&provider.api_base_url)?;
        let (api_key_source, api_key) = resolve_api_key(&provider, dry_run)?;
        info!(provider = %provider.key, model = %model.id, "selection complete");

        let mut plan = LaunchPlan {
            provider_key: provider.key.clone(),
            provider_name: provider.display_name.clone(),
            base_url: provider.api_base_url.clone(),
            model_id: model.id.clone(),
            model_name: model.display_name.clone(),
            api_key_source,
            api_key,
            proxy: None,
            assistant: self.assistant_plan(assistant_program, &model, request),
        };

        if provider.native {
            plan.assistant
                .env
                .insert(self.config.assistant.base_url_env.clone(), plan.base_url.clone());
            if dry_run {
                return Ok(LaunchOutcome::DryRun(plan));
            }
        } else {
            self.transition(LaunchStage::ProxyStarting);
            let proxy = self.proxy_plan(&plan, dry_run)?;
            plan.assistant
                .env
                .insert(self.config.assistant.base_url_env.clone(), proxy.endpoint());
            plan.proxy = Some(proxy);
            if dry_run {
                return Ok(LaunchOutcome::DryRun(plan));
            }
            self.start_proxy(&plan, &token).await?;
        }

        self.transition(LaunchStage::Launched);
        let code = match self.config.assistant.handoff {
            HandoffMode::Supervise => self.supervise(&plan, &token).await?,
            HandoffMode::Replace => self.replace(&plan, &token).await?,
        };
        Ok(LaunchOutcome::Exited { code })
    }

    async fn resolve_provider(
        &mut self,
        query: &CatalogQuery<'_>,
        request: &LaunchRequest,
        filter: SelectionFilter,
    ) -> LaunchResult<ProviderEntry> {
        let providers = query.list_providers(filter);
        if providers.is_empty() {
            return Err(LaunchError::Configuration(format!(
                "no provider offers a tool-capable model (filter: {})",
                filter
            )));
        }

        let requested = request
            .provider
            .clone()
            .or_else(|| self.config.selection.provider.clone())
            .filter(|name| !name.trim().is_empty());
        let name = match requested {
            Some(name) => name,
            None => {
                self.prompt(move |selector| selector.choose_provider(&providers))
                    .await?
            }
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(LaunchError::Configuration("empty provider selection".to_string()));
        }
        query.find_provider(name, filter).ok_or_else(|| {
            LaunchError::Configuration(format!(
                "provider '{}' is not in the catalog or has no matching models (filter: {})",
                name, filter
            ))
        })
    }

    async fn resolve_model(
        &mut self,
        query: &CatalogQuery<'_>,
        provider: &ProviderEntry,
        request: &LaunchRequest,
        filter: SelectionFilter,
    ) -> LaunchResult<Model> {
        let models = query.list_models(provider, filter);

        let id = if let Some(id) = request.model.clone() {
            id
        } else if let Some(model) = select_preferred(&models, &self.config.selection.preferred_models) {
            info!(model = %model.id, "using preferred model");
            model.id
        } else {
            let owner = provider.clone();
            let choices = models.clone();
            self.prompt(move |selector| selector.choose_model(&owner, &choices))
                .await?
        };

        let id = id.trim();
        if id.is_empty() {
            return Err(LaunchError::Configuration("empty model selection".to_string()));
        }
        models.into_iter().find(|m| m.id == id).ok_or_else(|| {
            LaunchError::Configuration(format!(
                "model '{}' is not offered by {} (filter: {})",
                id, provider.display_name, filter
            ))
        })
    }

    /// Run a selector prompt off the async threads so a signal can abort it.
    async fn prompt<F>(&mut self, ask: F) -> LaunchResult<String>
    where
        F: FnOnce(&mut S) -> io::Result<Choice> + Send + 'static,
    {
        let mut selector = self
            .selector
            .take()
            .ok_or_else(|| LaunchError::Internal("selector is unavailable".to_string()))?;
        let token = self.cleanup.token();
        let task = tokio::task::spawn_blocking(move || {
            let choice = ask(&mut selector);
            (selector, choice)
        });

        let (selector, choice) = until_cancelled(&token, task)
            .await?
            .map_err(|e| LaunchError::Internal(format!("selector task failed: {}", e)))?;
        self.selector = Some(selector);

        match choice? {
            Choice::Picked(value) => Ok(value),
            Choice::Cancelled => Err(LaunchError::UserCancelled),
        }
    }

    fn assistant_plan(
        &self,
        program: PathBuf,
        model: &Model,
        request: &LaunchRequest,
    ) -> AssistantPlan {
        let settings = &self.config.assistant;
        let mut args = Vec::new();
        if !settings.model_flag.trim().is_empty() {
            args.push(settings.model_flag.clone());
            args.push(model.id.clone());
        }
        args.extend(settings.args.iter().cloned());
        args.extend(request.assistant_args.iter().cloned());

        AssistantPlan {
            program,
            args,
            env: BTreeMap::new(),
            api_key_var: settings.api_key_env.clone(),
        }
    }

    fn proxy_plan(&self, plan: &LaunchPlan, dry_run: bool) -> LaunchResult<ProxyPlan> {
        let settings = &self.config.proxy;
        let program = check_dependency(&settings.program, dry_run)?;
        let port = find_free_port(
            settings.preferred_port,
            settings.port_range_start,
            settings.port_range_end,
        )?;
        if port != settings.preferred_port {
            info!(preferred = settings.preferred_port, port, "preferred proxy port busy");
        }

        let names = &settings.env;
        let mut env = settings.extra_env.clone();
        env.insert(names.base_url.clone(), plan.base_url.clone());
        env.insert(names.big_model.clone(), plan.model_id.clone());
        env.insert(names.middle_model.clone(), plan.model_id.clone());
        env.insert(names.small_model.clone(), plan.model_id.clone());
        env.insert(names.port.clone(), port.to_string());

        let args = settings
            .args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{host}", &settings.host)
            })
            .collect();

        Ok(ProxyPlan {
            program,
            args,
            host: settings.host.clone(),
            port,
            fragment: self.config.proxy_fragment(),
            env,
            api_key_var: names.api_key.clone(),
        })
    }

    async fn start_proxy(&mut self, plan: &LaunchPlan, token: &CancellationToken) -> LaunchResult<()> {
        let (Some(command), Some(proxy)) = (plan.proxy_command(), plan.proxy.as_ref()) else {
            return Err(LaunchError::Internal("no proxy in launch plan".to_string()));
        };

        self.cleanup.register(Box::new(ProxyFinalizer {
            supervisor: Arc::clone(&self.supervisor),
        }));

        let supervisor = Arc::clone(&self.supervisor);
        let port = proxy.port;
        let timeout = self.config.startup_timeout();
        let pid = until_cancelled(token, async move {
            supervisor.lock().await.start(&command, port, timeout).await
        })
        .await??;

        info!(pid, endpoint = %proxy.endpoint(), "proxy is accepting connections");
        Ok(())
    }

    /// Run the assistant as a child and return its exit code.
    async fn supervise(&self, plan: &LaunchPlan, token: &CancellationToken) -> LaunchResult<i32> {
        let program = plan.assistant.program.display().to_string();
        let mut child = tokio::process::Command::new(&plan.assistant.program)
            .args(&plan.assistant.args)
            .envs(plan.assistant_env())
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => LaunchError::DependencyMissing { program },
                _ => LaunchError::Io(err),
            })?;
        info!(pid = child.id(), "assistant started");

        // Same foreground group: the terminal delivers SIGINT to the assistant directly.
        self.cleanup.set_child_owns_interrupt(true);
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = token.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status,
            None => {
                if let (Some(pid), Some(signal)) = (child.id(), self.cleanup.received_signal()) {
                    forward_signal(pid, signal);
                }
                child.wait().await
            }
        };
        self.cleanup.set_child_owns_interrupt(false);

        let code = exit_code_of(status?);
        info!(code, "assistant exited");
        Ok(code)
    }

    /// Replace the launcher with the assistant. A running proxy outlives this
    /// process and is reclaimed by the next sweep.
    #[cfg(target_family = "unix")]
    async fn replace(&self, plan: &LaunchPlan, _token: &CancellationToken) -> LaunchResult<i32> {
        use std::os::unix::process::CommandExt;

        info!(program = %plan.assistant.program.display(), "replacing launcher with assistant");
        let err = std::process::Command::new(&plan.assistant.program)
            .args(&plan.assistant.args)
            .envs(plan.assistant_env())
            .exec();
        Err(LaunchError::Io(err))
    }

    #[cfg(not(target_family = "unix"))]
    async fn replace(&self, plan: &LaunchPlan, token: &CancellationToken) -> LaunchResult<i32> {
        warn!("replace handoff needs exec(2); supervising instead");
        self.supervise(plan, token).await
    }
}

async fn until_cancelled<F: Future>(token: &CancellationToken, fut: F) -> LaunchResult<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(LaunchError::UserCancelled),
        output = fut => Ok(output),
    }
}

fn check_dependency(program: &str, dry_run: bool) -> LaunchResult<PathBuf> {
    match resolve_program(program) {
        Ok(path) => Ok(path),
        Err(err) if dry_run => {
            warn!("dry run: {}", err);
            Ok(PathBuf::from(program))
        }
        Err(err) => Err(err),
    }
}

fn validate_base_url(raw: &str) -> LaunchResult<()> {
    let url = Url::parse(raw).map_err(|e| {
        LaunchError::Configuration(format!("provider base URL '{}' is invalid: {}", raw, e))
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(LaunchError::Configuration(format!(
            "provider base URL '{}' uses unsupported scheme '{}'",
            raw, scheme
        ))),
    }
}

/// First non-empty variable among the provider's auth variables.
fn resolve_api_key(
    provider: &ProviderEntry,
    dry_run: bool,
) -> LaunchResult<(Option<String>, Option<Secret>)> {
    if provider.auth_env_vars.is_empty() {
        debug!(provider = %provider.key, "provider declares no API key variable");
        return Ok((None, None));
    }

    let found = provider.auth_env_vars.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| (name.clone(), value))
    });
    match found {
        Some((name, value)) => Ok((Some(name), Some(Secret::new(value)))),
        None => {
            let message = format!(
                "no API key for {}: set {}",
                provider.display_name,
                provider.auth_env_vars.join(" or ")
            );
            if dry_run {
                warn!("dry run: {}", message);
                Ok((provider.auth_env_vars.first().cloned(), None))
            } else {
                Err(LaunchError::Configuration(message))
            }
        }
    }
}

#[cfg(target_family = "unix")]
fn forward_signal(pid: u32, signal: crate::cleanup::ShutdownSignal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    debug!(pid, %signal, "forwarding signal to assistant");
    if let Err(err) = kill(Pid::from_raw(pid as i32), signal.as_nix()) {
        warn!(pid, %signal, "failed to forward signal: {}", err);
    }
}

#[cfg(not(target_family = "unix"))]
fn forward_signal(_pid: u32, _signal: crate::cleanup::ShutdownSignal) {}

/// Exit code, or 128 + signal number for a signalled child.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(target_family = "unix")]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_must_be_http() {
        assert!(validate_base_url("https://api.groq.com/openai").is_ok());
        assert!(validate_base_url("http://localhost:11434").is_ok());
        assert!(matches!(
            validate_base_url("ftp://models.example"),
            Err(LaunchError::Configuration(_))
        ));
        assert!(validate_base_url("not a url").is_err());
    }

    fn provider_with_vars(vars: &[&str]) -> ProviderEntry {
        ProviderEntry {
            key: "example".into(),
            display_name: "Example".into(),
            sdk: "@ai-sdk/openai-compatible".into(),
            api_base_url: "https://example.test".into(),
            auth_env_vars: vars.iter().map(|v| v.to_string()).collect(),
            native: false,
            models: vec![],
        }
    }

    #[test]
    fn missing_key_is_fatal_except_in_dry_run() {
        let provider = provider_with_vars(&["RELAY_TEST_UNSET_KEY_A", "RELAY_TEST_UNSET_KEY_B"]);

        let err = resolve_api_key(&provider, false).unwrap_err();
        assert!(err.to_string().contains("RELAY_TEST_UNSET_KEY_A or RELAY_TEST_UNSET_KEY_B"));

        let (source, key) = resolve_api_key(&provider, true).unwrap();
        assert_eq!(source.as_deref(), Some("RELAY_TEST_UNSET_KEY_A"));
        assert!(key.is_none());

        assert_eq!(resolve_api_key(&provider_with_vars(&[]), false).unwrap(), (None, None));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn signalled_child_maps_to_128_plus_signal() {
        let status = std::process::Command::new("sh")
            .args(["-c", "kill -TERM $$"])
            .status()
            .unwrap();
        assert_eq!(exit_code_of(status), 128 + 15);

        let status = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .status()
            .unwrap();
        assert_eq!(exit_code_of(status), 3);
    }
}
