//! Resolved launch: what will run, where it points and which key it uses.
//!
//! The API key never appears in `Debug` output or in [`LaunchPlan::summary`];
//! it is only merged into the environment maps handed to child processes.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::PathBuf;

use relay_supervisor::ProxyCommand;

/// A credential that must not be logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct ProxyPlan {
    pub program: PathBuf,
    /// Rendered: `{port}`/`{host}` already substituted.
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub fragment: String,
    /// Everything except the API key.
    pub env: BTreeMap<String, String>,
    pub api_key_var: String,
}

impl ProxyPlan {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct AssistantPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Everything except the API key.
    pub env: BTreeMap<String, String>,
    pub api_key_var: String,
}

#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub provider_key: String,
    pub provider_name: String,
    pub base_url: String,
    pub model_id: String,
    pub model_name: String,
    /// Provider variable the key was read from (or would be, in a dry run).
    pub api_key_source: Option<String>,
    pub api_key: Option<Secret>,
    /// `None` for providers that speak the assistant's protocol natively.
    pub proxy: Option<ProxyPlan>,
    pub assistant: AssistantPlan,
}

impl LaunchPlan {
    pub fn proxy_command(&self) -> Option<ProxyCommand> {
        let proxy = self.proxy.as_ref()?;
        let mut command = ProxyCommand::new(&proxy.program)
            .args(proxy.args.iter().cloned())
            .host(&proxy.host)
            .fragment(&proxy.fragment);
        for (key, value) in &proxy.env {
            command = command.env(key, value);
        }
        if let Some(key) = &self.api_key {
            command = command.env(&proxy.api_key_var, key.expose());
        }
        Some(command)
    }

    pub fn assistant_env(&self) -> BTreeMap<String, String> {
        let mut env = self.assistant.env.clone();
        if let Some(key) = &self.api_key {
            env.insert(self.assistant.api_key_var.clone(), key.expose().to_string());
        }
        env
    }

    /// Human-readable dry-run report.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let key_state = match (&self.api_key_source, &self.api_key) {
            (Some(var), Some(_)) => format!("${} (set)", var),
            (Some(var), None) => format!("${} (not set)", var),
            (None, _) => "none required".to_string(),
        };

        let _ = writeln!(out, "Provider:  {} ({})", self.provider_name, self.provider_key);
        let _ = writeln!(out, "Base URL:  {}", self.base_url);
        if self.model_name == self.model_id {
            let _ = writeln!(out, "Model:     {}", self.model_id);
        } else {
            let _ = writeln!(out, "Model:     {} ({})", self.model_id, self.model_name);
        }
        let _ = writeln!(out, "API key:   {}", key_state);

        match &self.proxy {
            Some(proxy) => {
                let _ = writeln!(
                    out,
                    "Proxy:     {} on {}",
                    render_command(&proxy.program, &proxy.args),
                    proxy.endpoint()
                );
                write_env(&mut out, &proxy.env, self.redacted(&proxy.api_key_var));
            }
            None => {
                let _ = writeln!(out, "Proxy:     not needed (native provider)");
            }
        }

        let _ = writeln!(
            out,
            "Assistant: {}",
            render_command(&self.assistant.program, &self.assistant.args)
        );
        write_env(&mut out, &self.assistant.env, self.redacted(&self.assistant.api_key_var));
        out
    }

    /// The variable the key will be exported as, when there is a key.
    fn redacted<'a>(&self, key_var: &'a str) -> Option<&'a str> {
        self.api_key.as_ref().map(|_| key_var)
    }
}

fn render_command(program: &std::path::Path, args: &[String]) -> String {
    let mut rendered = program.display().to_string();
    for arg in args {
        rendered.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            rendered.push_str(&format!("{:?}", arg));
        } else {
            rendered.push_str(arg);
        }
    }
    rendered
}

fn write_env(out: &mut String, env: &BTreeMap<String, String>, key_var: Option<&str>) {
    for (key, value) in env {
        let _ = writeln!(out, "  {}={}", key, value);
    }
    if let Some(key_var) = key_var {
        let _ = writeln!(out, "  {}=<redacted>", key_var);
    }
}
