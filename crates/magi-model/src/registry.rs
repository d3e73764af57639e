//! Provider registry: model-prefix dispatch over configured drivers.
//!
//! Providers plug in keyed by name; selection walks the prefix table and
//! picks the longest match so `deepseek-reasoner` can route differently from
//! the rest of the `deepseek-` family when configured that way.

use std::sync::Arc;

use anyhow::Context;

use magi_config::ModelsConfig;

use crate::{
    anthropic::AnthropicProvider,
    mock::EchoProvider,
    openai_compat::OpenAiCompatProvider,
    provider::Provider,
};

pub struct ProviderRegistry {
    /// (model prefix, provider) pairs, longest-prefix wins.
    entries: Vec<(String, Arc<dyn Provider>)>,
    default: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            default: None,
        }
    }

    pub fn register(&mut self, prefix: impl Into<String>, provider: Arc<dyn Provider>) {
        self.entries.push((prefix.into(), provider));
    }

    /// Fallback used when no prefix matches.
    pub fn set_default(&mut self, provider: Arc<dyn Provider>) {
        self.default = Some(provider);
    }

    /// Resolve the provider for a model name by longest prefix match.
    pub fn resolve(&self, model: &str) -> anyhow::Result<Arc<dyn Provider>> {
        self.entries
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, p)| Arc::clone(p))
            .or_else(|| self.default.clone())
            .with_context(|| format!("no provider registered for model '{model}'"))
    }

    /// Build the registry from config.  Driver ids: `openai_compat`,
    /// `anthropic`, `mock`.
    pub fn from_config(cfg: &ModelsConfig) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        // Sort for deterministic construction order (HashMap iteration varies).
        let mut named: Vec<_> = cfg.providers.iter().collect();
        named.sort_by_key(|(name, _)| name.as_str());

        for (name, provider_cfg) in named {
            let provider: Arc<dyn Provider> = match provider_cfg.driver.as_str() {
                "openai_compat" => {
                    Arc::new(OpenAiCompatProvider::from_config(name, provider_cfg)?)
                }
                "anthropic" => Arc::new(AnthropicProvider::from_config(provider_cfg)),
                "mock" => Arc::new(EchoProvider),
                other => anyhow::bail!("unknown provider driver '{other}' for '{name}'"),
            };
            for prefix in &provider_cfg.model_prefixes {
                registry.register(prefix.clone(), Arc::clone(&provider));
            }
        }
        Ok(registry)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedProvider;

    fn scripted(_tag: &str) -> Arc<dyn Provider> {
        Arc::new(ScriptedProvider::new(vec![]))
    }

    #[test]
    fn resolve_matches_prefix() {
        let mut r = ProviderRegistry::new();
        r.register("deepseek-", scripted("a"));
        assert!(r.resolve("deepseek-chat").is_ok());
    }

    #[test]
    fn resolve_prefers_longest_prefix() {
        let mut r = ProviderRegistry::new();
        let general = scripted("general");
        let special = scripted("special");
        r.register("deepseek-", Arc::clone(&general));
        r.register("deepseek-reasoner", Arc::clone(&special));
        let resolved = r.resolve("deepseek-reasoner").unwrap();
        assert!(Arc::ptr_eq(&resolved, &special));
    }

    #[test]
    fn resolve_unknown_without_default_errors() {
        let r = ProviderRegistry::new();
        assert!(r.resolve("mystery-model").is_err());
    }

    #[test]
    fn resolve_unknown_falls_back_to_default() {
        let mut r = ProviderRegistry::new();
        let fallback = scripted("fallback");
        r.set_default(Arc::clone(&fallback));
        let resolved = r.resolve("mystery-model").unwrap();
        assert!(Arc::ptr_eq(&resolved, &fallback));
    }

    #[test]
    fn from_config_rejects_unknown_driver() {
        let yaml = r#"
providers:
  broken:
    driver: quantum
    model_prefixes: ["q-"]
"#;
        let cfg: ModelsConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(ProviderRegistry::from_config(&cfg).is_err());
    }

    #[test]
    fn from_config_registers_mock_driver() {
        let yaml = r#"
providers:
  testing:
    driver: mock
    model_prefixes: ["echo-"]
"#;
        let cfg: ModelsConfig = serde_yaml::from_str(yaml).unwrap();
        let r = ProviderRegistry::from_config(&cfg).unwrap();
        assert_eq!(r.resolve("echo-1").unwrap().name(), "echo");
    }
}
