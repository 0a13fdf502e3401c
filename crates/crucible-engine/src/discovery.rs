//! Model discovery: synchronize the catalogue with what each configured
//! backend actually serves.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crucible_providers::ProviderRegistry;
use crucible_store::{AuditKind, AvailableModel, ForensicStore};

use crate::error::EngineError;

/// Runs discovery sweeps on demand or on an interval.
#[derive(Clone)]
pub struct ModelDiscovery {
    store: ForensicStore,
    registry: Arc<ProviderRegistry>,
}

impl ModelDiscovery {
    pub fn new(store: ForensicStore, registry: Arc<ProviderRegistry>) -> Self {
        Self { store, registry }
    }

    /// Query every provider's model listing and upsert the catalogue.
    /// A provider-wide failure marks that provider's existing entries
    /// unavailable. Returns the number of models upserted.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let mut total = 0usize;

        for name in self.registry.provider_names() {
            let Some(provider) = self.registry.get(&name) else {
                continue;
            };

            match provider.list_models().await {
                Ok(entries) => {
                    let now = chrono::Utc::now();
                    let count = entries.len();
                    for entry in entries {
                        self.store.upsert_model(&AvailableModel {
                            id: format!("{name}/{}", entry.name),
                            provider: name.clone(),
                            name: entry.name,
                            display_name: entry.display_name,
                            context_window: entry.context_window.map(i64::from),
                            available: true,
                            last_checked_at: Some(now),
                            last_error: None,
                            capabilities: None,
                            discovered_at: now,
                            owner_id: None,
                        })?;
                        total += 1;
                    }
                    info!(provider = %name, count, "discovery refreshed provider models");
                }
                Err(e) => {
                    warn!(provider = %name, "discovery failed, marking models unavailable: {e}");
                    self.store
                        .mark_provider_unavailable(&name, &e.to_string())?;
                }
            }
        }

        let _ = self.store.record_audit(
            None,
            None,
            AuditKind::ModelDiscovered,
            Some(&json!({"count": total})),
        );
        Ok(total)
    }

    /// Spawn a periodic sweep that stops when the token fires.
    pub fn spawn_periodic(
        self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; that is the startup sweep.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!("discovery sweep failed: {e}");
                        }
                    }
                }
            }
        })
    }
}
