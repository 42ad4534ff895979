// Filtering and projection over a loaded catalog.

use std::fmt;
use std::str::FromStr;

use crate::model::{Catalog, Model, ProviderEntry};

/// Model filter chosen once per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionFilter {
    #[default]
    None,
    FreeOnly,
    ReasoningOnly,
}

impl SelectionFilter {
    /// Every filter requires tool calling; the assistant cannot work without it.
    pub fn admits(&self, model: &Model) -> bool {
        is_tool_capable(model)
            && match self {
                SelectionFilter::None => true,
                SelectionFilter::FreeOnly => is_free(model),
                SelectionFilter::ReasoningOnly => is_reasoning(model),
            }
    }
}

impl FromStr for SelectionFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "all" => Ok(SelectionFilter::None),
            "free" | "free-only" => Ok(SelectionFilter::FreeOnly),
            "reasoning" | "reasoning-only" => Ok(SelectionFilter::ReasoningOnly),
            other => Err(format!(
                "unknown filter '{}' (expected none, free or reasoning)",
                other
            )),
        }
    }
}

impl fmt::Display for SelectionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionFilter::None => "none",
            SelectionFilter::FreeOnly => "free",
            SelectionFilter::ReasoningOnly => "reasoning",
        };
        f.write_str(name)
    }
}

fn is_tool_capable(model: &Model) -> bool {
    model.supports_tools
}

/// Missing cost data is not free.
fn is_free(model: &Model) -> bool {
    model
        .cost
        .map(|cost| cost.input == 0.0 && cost.output == 0.0)
        .unwrap_or(false)
}

fn is_reasoning(model: &Model) -> bool {
    model.supports_reasoning
}

pub struct CatalogQuery<'a> {
    catalog: &'a Catalog,
}

impl<'a> CatalogQuery<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Providers with at least one admitted model, each carrying only those models.
    pub fn list_providers(&self, filter: SelectionFilter) -> Vec<ProviderEntry> {
        self.catalog
            .providers
            .iter()
            .filter_map(|provider| restrict(provider, filter))
            .collect()
    }

    /// Exact key match, then a case-insensitive display-name match.
    pub fn find_provider(&self, name: &str, filter: SelectionFilter) -> Option<ProviderEntry> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let provider = self
            .catalog
            .providers
            .iter()
            .find(|p| p.key == name)
            .or_else(|| {
                self.catalog
                    .providers
                    .iter()
                    .find(|p| p.display_name.eq_ignore_ascii_case(name))
            })?;
        restrict(provider, filter)
    }

    pub fn list_models(&self, provider: &ProviderEntry, filter: SelectionFilter) -> Vec<Model> {
        provider
            .models
            .iter()
            .filter(|model| filter.admits(model))
            .cloned()
            .collect()
    }
}

fn restrict(provider: &ProviderEntry, filter: SelectionFilter) -> Option<ProviderEntry> {
    let models: Vec<Model> = provider
        .models
        .iter()
        .filter(|model| filter.admits(model))
        .cloned()
        .collect();
    if models.is_empty() {
        return None;
    }
    Some(ProviderEntry {
        models,
        ..provider.clone()
    })
}

/// First preference that is a substring of some model id wins; among models
/// matching it, catalog order decides.
pub fn select_preferred(models: &[Model], preferred: &[String]) -> Option<Model> {
    preferred
        .iter()
        .map(|pref| pref.trim())
        .filter(|pref| !pref.is_empty())
        .find_map(|pref| models.iter().find(|model| model.id.contains(pref)))
        .cloned()
}
