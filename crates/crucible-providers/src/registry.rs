//! Provider registry and routing.
//!
//! Routing contract:
//! 1. A model string containing `/` splits into `(provider, name)`. If the
//!    prefix names a registered provider, the request is dispatched to it
//!    with the bare name. Unknown prefixes fall through.
//! 2. Otherwise the fallback chain is walked in declared order; the first
//!    success wins and the last provider error is returned if all fail.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::{CompletionRequest, CompletionResponse, LlmProvider};

/// Split a model identifier at the first `/` into `(provider, name)`.
pub fn split_model(model: &str) -> Option<(&str, &str)> {
    model.split_once('/')
}

/// Registry of configured providers plus the fallback order.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    fallback: Vec<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name. Registration order becomes
    /// the fallback order unless [`set_fallback`](Self::set_fallback)
    /// overrides it.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        if !self.fallback.contains(&name) {
            self.fallback.push(name.clone());
        }
        self.providers.insert(name, provider);
    }

    /// Override the fallback chain. Names without a registered provider
    /// are skipped at dispatch time.
    pub fn set_fallback(&mut self, order: Vec<String>) {
        self.fallback = order;
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).cloned()
    }

    /// Provider names in fallback order.
    pub fn provider_names(&self) -> Vec<String> {
        self.fallback
            .iter()
            .filter(|name| self.providers.contains_key(*name))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Dispatch a completion request per the routing contract.
    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if let Some((prefix, bare)) = split_model(&request.model) {
            if let Some(provider) = self.get(prefix) {
                debug!(provider = prefix, model = bare, "routing by model prefix");
                let mut pinned = request.clone();
                pinned.model = bare.to_string();
                return provider.complete(pinned).await;
            }
            // Unknown prefix: fall through to the chain with the full
            // string intact.
        }

        let mut last_error: Option<ProviderError> = None;
        for name in self.provider_names() {
            let provider = match self.get(&name) {
                Some(p) => p,
                None => continue,
            };
            debug!(provider = %name, "trying fallback provider");
            match provider.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(provider = %name, "fallback provider failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::NotFound("<fallback chain>".to_string())))
    }

    /// Dispatch to one named provider, bypassing routing. Used for steps
    /// pinned to a provider.
    pub async fn complete_via(
        &self,
        provider_name: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let provider = self
            .get(provider_name)
            .ok_or_else(|| ProviderError::NotFound(provider_name.to_string()))?;

        // Strip a matching prefix so the backend sees its bare model name.
        let mut pinned = request;
        if let Some((prefix, bare)) = split_model(&pinned.model) {
            if prefix == provider_name {
                pinned.model = bare.to_string();
            }
        }
        provider.complete(pinned).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, ModelEntry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted provider for routing tests.
    struct ScriptedProvider {
        name: String,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Wire {
                    provider: self.name.clone(),
                    model: request.model,
                    detail: "scripted failure".into(),
                });
            }
            Ok(CompletionResponse {
                provider: self.name.clone(),
                model: request.model,
                content: format!("answer from {}", self.name),
                tokens_in: 1,
                tokens_out: 1,
                finish_reason: Some("stop".into()),
                latency_ms: 1,
            })
        }

        async fn list_models(&self) -> Result<Vec<ModelEntry>, ProviderError> {
            Ok(vec![])
        }
    }

    fn request(model: &str) -> CompletionRequest {
        CompletionRequest::new(model, vec![Message::user("hello")])
    }

    #[test]
    fn test_split_model() {
        assert_eq!(split_model("vendor/m1"), Some(("vendor", "m1")));
        assert_eq!(split_model("vendor/m/1"), Some(("vendor", "m/1")));
        assert_eq!(split_model("bare-model"), None);
    }

    #[tokio::test]
    async fn test_prefix_routing_strips_provider() {
        let mut registry = ProviderRegistry::new();
        let vendor = ScriptedProvider::new("vendor", false);
        registry.register(vendor.clone());

        let response = registry.complete(request("vendor/m1")).await.unwrap();
        assert_eq!(response.provider, "vendor");
        assert_eq!(response.model, "m1");
    }

    #[tokio::test]
    async fn test_unknown_prefix_falls_through_to_chain() {
        let mut registry = ProviderRegistry::new();
        let fallback = ScriptedProvider::new("fallback", false);
        registry.register(fallback.clone());

        let response = registry.complete(request("ghost/m9")).await.unwrap();
        assert_eq!(response.provider, "fallback");
        // The chain sees the original, unsplit model string.
        assert_eq!(response.model, "ghost/m9");
    }

    #[tokio::test]
    async fn test_fallback_tries_in_declared_order() {
        let mut registry = ProviderRegistry::new();
        let first = ScriptedProvider::new("first", true);
        let second = ScriptedProvider::new("second", false);
        registry.register(first.clone());
        registry.register(second.clone());

        let response = registry.complete(request("any-model")).await.unwrap();
        assert_eq!(response.provider, "second");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_failures_return_last_error() {
        let mut registry = ProviderRegistry::new();
        registry.register(ScriptedProvider::new("a", true));
        registry.register(ScriptedProvider::new("b", true));

        let err = registry.complete(request("any-model")).await.unwrap_err();
        match err {
            ProviderError::Wire { provider, .. } => assert_eq!(provider, "b"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_not_found() {
        let registry = ProviderRegistry::new();
        let err = registry.complete(request("any-model")).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_complete_via_requires_registration() {
        let registry = ProviderRegistry::new();
        let err = registry
            .complete_via("ghost", request("m"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_complete_via_strips_matching_prefix() {
        let mut registry = ProviderRegistry::new();
        registry.register(ScriptedProvider::new("vendor", false));

        let response = registry
            .complete_via("vendor", request("vendor/m1"))
            .await
            .unwrap();
        assert_eq!(response.model, "m1");

        let response = registry
            .complete_via("vendor", request("other/m1"))
            .await
            .unwrap();
        assert_eq!(response.model, "other/m1");
    }

    #[tokio::test]
    async fn test_fallback_override() {
        let mut registry = ProviderRegistry::new();
        let a = ScriptedProvider::new("a", false);
        let b = ScriptedProvider::new("b", false);
        registry.register(a.clone());
        registry.register(b.clone());
        registry.set_fallback(vec!["b".into(), "a".into()]);

        let response = registry.complete(request("any")).await.unwrap();
        assert_eq!(response.provider, "b");
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }
}
