//! Configuration loading.
//!
//! Settings come from an optional `crucible.toml` layered under
//! `CRUCIBLE_*` environment overrides. API keys never live in the file;
//! each provider entry names the environment variable carrying its key.

use anyhow::Context;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crucible_providers::{
    AnthropicProvider, GeminiProvider, LlmProvider, OpenAiCompatProvider, ProviderRegistry,
};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CrucibleConfig {
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Fallback chain, in order. Defaults to registration order.
    #[serde(default)]
    pub fallback: Vec<String>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Paths of the three stores.
#[derive(Debug, Clone, Deserialize)]
pub struct StoresConfig {
    #[serde(default = "default_forensic_path")]
    pub forensic_path: String,
    #[serde(default = "default_tree_path")]
    pub tree_path: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            forensic_path: default_forensic_path(),
            tree_path: default_tree_path(),
            metrics_path: default_metrics_path(),
        }
    }
}

fn default_forensic_path() -> String {
    "crucible.db".to_string()
}

fn default_tree_path() -> String {
    "tree.db".to_string()
}

fn default_metrics_path() -> String {
    "metrics.db".to_string()
}

/// One configured backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub family: ProviderFamily,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(default)]
    pub default_model: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Wire family of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    Openai,
    Anthropic,
    Gemini,
}

/// Discovery settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DiscoveryConfig {
    /// Periodic sweep interval; absent means on-demand only.
    pub interval_secs: Option<u64>,
}

impl CrucibleConfig {
    /// Load configuration, optionally from an explicit file path.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("crucible").required(false));
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder
            .add_source(config::Environment::with_prefix("CRUCIBLE").separator("__"));

        builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }
}

/// Build the provider registry from configuration. Backends without a
/// key in the environment are skipped with a warning.
pub fn build_registry(config: &CrucibleConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    for entry in &config.providers {
        if !entry.enabled {
            continue;
        }
        let api_key = match std::env::var(&entry.api_key_env) {
            Ok(key) if !key.is_empty() => key,
            _ => {
                warn!(
                    provider = %entry.name,
                    env = %entry.api_key_env,
                    "skipping provider: api key not set"
                );
                continue;
            }
        };

        let provider: Result<Arc<dyn LlmProvider>, _> = match entry.family {
            ProviderFamily::Openai => OpenAiCompatProvider::new(
                entry.name.clone(),
                entry.base_url.clone(),
                api_key,
                entry.default_model.clone(),
            )
            .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
            ProviderFamily::Anthropic => AnthropicProvider::new(
                entry.name.clone(),
                entry.base_url.clone(),
                api_key,
                entry.default_model.clone(),
            )
            .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
            ProviderFamily::Gemini => GeminiProvider::new(
                entry.name.clone(),
                entry.base_url.clone(),
                api_key,
                entry.default_model.clone(),
            )
            .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
        };

        match provider {
            Ok(provider) => registry.register(provider),
            Err(e) => warn!(provider = %entry.name, "skipping provider: {e}"),
        }
    }

    if !config.fallback.is_empty() {
        registry.set_fallback(config.fallback.clone());
    }
    registry
}
