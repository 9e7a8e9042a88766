//! Periodic provider health probing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};

use crate::adapter::AdapterSet;
use crate::registry::{HealthStatus, ProviderRegistry};

pub struct HealthChecker {
    registry: Arc<ProviderRegistry>,
    adapters: AdapterSet,
}

impl HealthChecker {
    pub fn new(registry: Arc<ProviderRegistry>, adapters: AdapterSet) -> Self {
        Self { registry, adapters }
    }

    /// Probe one provider and record the result.
    pub async fn check_one(&self, id: Uuid) -> CampaignResult<HealthStatus> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| CampaignError::not_found("provider", id))?;
        let status = match self.adapters.for_provider(&record.settings) {
            Some(adapter) => adapter.health_check(&record.settings).await,
            None => {
                warn!(kind = record.settings.credentials.kind(), "No adapter for provider kind");
                HealthStatus::Unhealthy
            }
        };
        self.registry.set_health(id, status)?;
        Ok(status)
    }

    /// Probe every active provider. Returns how many are healthy.
    pub async fn check_all(&self) -> usize {
        let mut healthy = 0;
        for record in self.registry.list(None) {
            if !record.settings.is_active {
                continue;
            }
            match self.check_one(record.id()).await {
                Ok(HealthStatus::Healthy) => healthy += 1,
                Ok(_) => {}
                Err(e) => warn!(provider = %record.settings.name, error = %e, "Health check failed"),
            }
        }
        metrics::gauge!("providers.healthy").set(healthy as f64);
        healthy
    }

    /// Run `check_all` every `interval` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let healthy = self.check_all().await;
                    info!(healthy, total = self.registry.len(), "Provider health sweep complete");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
