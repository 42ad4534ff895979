//! Typed view of a models.dev-style provider catalog.
//!
//! The raw document maps provider keys to objects carrying `id`, `name`, `npm`
//! (the SDK compatibility tag), `api`, `env` and `models`. Only providers whose
//! tag is accepted by the [`SdkPolicy`] are kept; document order is preserved.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{CatalogError, CatalogResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub display_name: String,
    pub supports_tools: bool,
    pub supports_reasoning: bool,
    pub cost: Option<Cost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub key: String,
    pub display_name: String,
    pub sdk: String,
    /// Normalized: no trailing `/v1` and no trailing slash.
    pub api_base_url: String,
    pub auth_env_vars: Vec<String>,
    /// Speaks the assistant's protocol directly; no proxy needed.
    pub native: bool,
    pub models: Vec<Model>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub providers: Vec<ProviderEntry>,
}

/// One accepted SDK compatibility tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkRule {
    pub tag: String,
    /// Used when a provider omits `api`.
    pub default_base_url: Option<String>,
    pub native: bool,
}

impl SdkRule {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            default_base_url: None,
            native: false,
        }
    }

    pub fn with_default_base_url(mut self, url: impl Into<String>) -> Self {
        self.default_base_url = Some(url.into());
        self
    }

    pub fn native(mut self) -> Self {
        self.native = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkPolicy {
    rules: Vec<SdkRule>,
}

impl Default for SdkPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                SdkRule::new("@ai-sdk/openai-compatible"),
                SdkRule::new("@ai-sdk/openai").with_default_base_url("https://api.openai.com/v1"),
                SdkRule::new("@ai-sdk/anthropic")
                    .with_default_base_url("https://api.anthropic.com")
                    .native(),
            ],
        }
    }
}

impl SdkPolicy {
    pub fn new(rules: Vec<SdkRule>) -> Self {
        Self { rules }
    }

    pub fn rule(&self, tag: &str) -> Option<&SdkRule> {
        self.rules.iter().find(|rule| rule.tag == tag)
    }

    pub fn rules(&self) -> &[SdkRule] {
        &self.rules
    }
}

#[derive(Debug, Deserialize)]
struct RawProvider {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    npm: Option<String>,
    #[serde(default)]
    api: Option<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    models: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawModel {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tool_call: bool,
    #[serde(default)]
    reasoning: bool,
    #[serde(default)]
    cost: Option<RawCost>,
}

#[derive(Debug, Deserialize)]
struct RawCost {
    #[serde(default)]
    input: Option<f64>,
    #[serde(default)]
    output: Option<f64>,
}

impl Catalog {
    /// Build from the raw document. The document must be a JSON object and yield
    /// at least one accepted provider.
    pub fn from_document(document: &Value, policy: &SdkPolicy) -> CatalogResult<Self> {
        let object = document.as_object().ok_or_else(|| {
            CatalogError::Validation("catalog root is not a JSON object".to_string())
        })?;

        let providers: Vec<ProviderEntry> = object
            .iter()
            .filter_map(|(key, value)| parse_provider(key, value, policy))
            .collect();

        if providers.is_empty() {
            return Err(CatalogError::Validation(format!(
                "none of {} providers uses an accepted SDK",
                object.len()
            )));
        }
        Ok(Self { providers })
    }

    pub fn provider(&self, key: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.key == key)
    }
}

fn parse_provider(key: &str, value: &Value, policy: &SdkPolicy) -> Option<ProviderEntry> {
    let raw: RawProvider = match serde_json::from_value(value.clone()) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(provider = key, "skipping unparsable provider: {}", err);
            return None;
        }
    };

    let sdk = raw.npm?;
    let rule = policy.rule(&sdk)?;
    let Some(base_url) = raw
        .api
        .filter(|api| !api.trim().is_empty())
        .or_else(|| rule.default_base_url.clone())
    else {
        debug!(provider = key, "skipping provider without API base URL");
        return None;
    };

    let models = raw
        .models
        .iter()
        .filter_map(|(model_key, value)| parse_model(model_key, value))
        .collect();

    Some(ProviderEntry {
        key: key.to_string(),
        display_name: raw.name.unwrap_or_else(|| key.to_string()),
        sdk,
        api_base_url: normalize_base_url(&base_url),
        auth_env_vars: raw.env,
        native: rule.native,
        models,
    })
}

fn parse_model(key: &str, value: &Value) -> Option<Model> {
    let raw: RawModel = serde_json::from_value(value.clone()).ok()?;
    let id = raw.id.unwrap_or_else(|| key.to_string());
    let cost = raw.cost.and_then(|cost| {
        Some(Cost {
            input: cost.input?,
            output: cost.output?,
        })
    });
    Some(Model {
        display_name: raw.name.unwrap_or_else(|| id.clone()),
        id,
        supports_tools: raw.tool_call,
        supports_reasoning: raw.reasoning,
        cost,
    })
}

/// Strip a trailing `/v1` (with or without slash) and any trailing `/`.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/v1").unwrap_or(trimmed);
    trimmed.trim_end_matches('/').to_string()
}
