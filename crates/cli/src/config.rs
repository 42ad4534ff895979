//! # Launcher configuration
//!
//! Loaded from the first TOML file found in this order:
//! 1. `--config <FILE>`
//! 2. `RELAY_CONFIG`
//! 3. `./relay.toml`
//! 4. `<config_dir>/relay/config.toml` (or `$RELAY_HOME/config.toml`)
//!
//! Missing sections fall back to built-in defaults. Environment variables are
//! applied on top: `AUTO_SELECT_PROVIDER`, `PROXY_STARTUP_TIMEOUT`,
//! `RELAY_CATALOG_URL`, `RELAY_FILTER` and `RELAY_PROXY_PORT`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use relay_catalog::{SelectionFilter, DEFAULT_CATALOG_URL};
use relay_common::RelayPaths;

use crate::errors::{LaunchError, LaunchResult};

pub const CONFIG_ENV: &str = "RELAY_CONFIG";
pub const LOCAL_CONFIG_FILE: &str = "relay.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub catalog: CatalogSettings,
    pub selection: SelectionSettings,
    pub proxy: ProxySettings,
    pub assistant: AssistantSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub url: String,
    pub ttl_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CATALOG_URL.to_string(),
            ttl_secs: 3600,
            fetch_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionSettings {
    /// Provider chosen without prompting.
    pub provider: Option<String>,
    /// `none`, `free` or `reasoning`.
    pub filter: Option<String>,
    /// Substrings of model ids, tried in order.
    pub preferred_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub program: String,
    /// May contain `{port}` and `{host}`.
    pub args: Vec<String>,
    /// Command-line fragment identifying the proxy; defaults to the program's file name.
    pub fragment: Option<String>,
    pub host: String,
    pub preferred_port: u16,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub startup_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub env: ProxyEnvNames,
    /// Extra variables passed verbatim.
    pub extra_env: BTreeMap<String, String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            program: "claude-code-proxy".to_string(),
            args: Vec::new(),
            fragment: None,
            host: "127.0.0.1".to_string(),
            preferred_port: 8082,
            port_range_start: 8082,
            port_range_end: 8182,
            startup_timeout_secs: 30,
            stop_timeout_secs: 30,
            env: ProxyEnvNames::default(),
            extra_env: BTreeMap::new(),
        }
    }
}

/// Variable names of the proxy's environment contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyEnvNames {
    pub base_url: String,
    pub api_key: String,
    pub big_model: String,
    pub middle_model: String,
    pub small_model: String,
    pub port: String,
}

impl Default for ProxyEnvNames {
    fn default() -> Self {
        Self {
            base_url: "OPENAI_BASE_URL".to_string(),
            api_key: "OPENAI_API_KEY".to_string(),
            big_model: "BIG_MODEL".to_string(),
            middle_model: "MIDDLE_MODEL".to_string(),
            small_model: "SMALL_MODEL".to_string(),
            port: "PORT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// Run the assistant as a child and clean up after it exits.
    #[default]
    Supervise,
    /// exec(2) into the assistant.
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantSettings {
    pub program: String,
    /// Empty to omit the flag.
    pub model_flag: String,
    pub base_url_env: String,
    pub api_key_env: String,
    pub handoff: HandoffMode,
    /// Prepended to the passthrough arguments.
    pub args: Vec<String>,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            model_flag: "--model".to_string(),
            base_url_env: "ANTHROPIC_BASE_URL".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            handoff: HandoffMode::Supervise,
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Console level when neither `--log-level` nor `RUST_LOG` is set.
    pub level: Option<String>,
    /// Daily-rotated debug log under the data directory.
    pub file: bool,
    pub retain_files: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: None,
            file: true,
            retain_files: 7,
        }
    }
}

impl LaunchConfig {
    /// Resolve and parse the configuration file. Returns the path it came from.
    pub fn load(
        explicit: Option<&Path>,
        paths: &RelayPaths,
        env: impl Fn(&str) -> Option<String>,
    ) -> LaunchResult<(Self, Option<PathBuf>)> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| env(CONFIG_ENV).filter(|v| !v.is_empty()).map(PathBuf::from));

        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(LaunchError::Configuration(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            return Ok((Self::from_file(&path)?, Some(path)));
        }

        for candidate in [PathBuf::from(LOCAL_CONFIG_FILE), paths.user_config.clone()] {
            if candidate.is_file() {
                return Ok((Self::from_file(&candidate)?, Some(candidate)));
            }
        }

        debug!("no config file found, using defaults");
        Ok((Self::default(), None))
    }

    pub fn from_file(path: &Path) -> LaunchResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            LaunchError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
            .map_err(|e| LaunchError::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(contents: &str) -> Result<Self, String> {
        let config: LaunchConfig = toml::from_str(contents).map_err(|e| e.to_string())?;
        config.validate().map_err(|errors| errors.join(", "))?;
        Ok(config)
    }

    /// Apply environment overrides, then re-validate.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> LaunchResult<()> {
        let set = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        if let Some(provider) = set("AUTO_SELECT_PROVIDER") {
            self.selection.provider = Some(provider);
        }
        if let Some(raw) = set("PROXY_STARTUP_TIMEOUT") {
            self.proxy.startup_timeout_secs = raw.trim().parse().map_err(|_| {
                LaunchError::Configuration(format!(
                    "PROXY_STARTUP_TIMEOUT must be a number of seconds, got '{}'",
                    raw
                ))
            })?;
        }
        if let Some(url) = set("RELAY_CATALOG_URL") {
            self.catalog.url = url;
        }
        if let Some(filter) = set("RELAY_FILTER") {
            self.selection.filter = Some(filter);
        }
        if let Some(raw) = set("RELAY_PROXY_PORT") {
            self.proxy.preferred_port = raw.trim().parse().map_err(|_| {
                LaunchError::Configuration(format!("RELAY_PROXY_PORT is not a port: '{}'", raw))
            })?;
        }

        self.validate()
            .map_err(|errors| LaunchError::Configuration(errors.join(", ")))
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.catalog.url.trim().is_empty() {
            errors.push("catalog.url must not be empty".to_string());
        } else {
            match url::Url::parse(self.catalog.url.trim()) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => errors.push(format!(
                    "catalog.url must use http or https, got '{}'",
                    url.scheme()
                )),
                Err(e) => errors.push(format!("catalog.url '{}' is invalid: {}", self.catalog.url, e)),
            }
        }
        if self.catalog.fetch_timeout_secs == 0 {
            errors.push("catalog.fetch_timeout_secs must be positive".to_string());
        }
        if let Err(e) = self.filter() {
            errors.push(e);
        }
        if self.proxy.program.trim().is_empty() {
            errors.push("proxy.program must not be empty".to_string());
        }
        if self.proxy.startup_timeout_secs == 0 {
            errors.push("proxy.startup_timeout_secs must be positive".to_string());
        }
        if self.proxy.port_range_start == 0
            || self.proxy.port_range_start > self.proxy.port_range_end
        {
            errors.push(format!(
                "proxy port range {}-{} is invalid",
                self.proxy.port_range_start, self.proxy.port_range_end
            ));
        }
        if self.assistant.program.trim().is_empty() {
            errors.push("assistant.program must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn filter(&self) -> Result<SelectionFilter, String> {
        self.selection
            .filter
            .as_deref()
            .map(str::parse::<SelectionFilter>)
            .unwrap_or(Ok(SelectionFilter::None))
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog.ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.catalog.fetch_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.startup_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.stop_timeout_secs)
    }

    /// Fragment that identifies a running proxy in the process table.
    pub fn proxy_fragment(&self) -> String {
        self.proxy
            .fragment
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| {
                Path::new(&self.proxy.program)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.proxy.program.clone())
            })
    }
}
