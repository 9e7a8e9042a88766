//! Provider registry and selection.
//!
//! Selection walks the channel's providers in a fixed order and takes a quota
//! slot with an atomic compare-and-increment on the usage counter, so two
//! workers can never both take the last slot of a provider.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_core::clock::Clock;
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::providers::ProviderSettings;
use campaign_core::types::{Channel, FailureReason};

use crate::usage::{UsageCounter, UsageSnapshot};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// A registered provider with its runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRecord {
    pub settings: ProviderSettings,
    pub health: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ProviderRecord {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            settings,
            health: HealthStatus::Unknown,
            last_health_check: None,
            deleted_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.settings.id
    }

    pub fn channel(&self) -> Channel {
        self.settings.channel()
    }

    /// Active, not deleted, and carrying every required credential.
    pub fn is_usable(&self) -> bool {
        self.settings.is_active
            && self.deleted_at.is_none()
            && self.settings.credentials.has_minimum_credentials()
    }
}

/// The provider a send will go through. One quota slot has been taken for it.
#[derive(Debug, Clone)]
pub struct SelectedProvider {
    pub settings: ProviderSettings,
    pub health: HealthStatus,
    /// Chosen by the unknown-health default fallback.
    pub degraded: bool,
    /// When the quota slot was taken.
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no active provider configured for {0}")]
    NoProvider(Channel),
    #[error("every {0} provider is over its daily or monthly quota")]
    QuotaExhausted(Channel),
    #[error("{0} provider '{1}' is missing credentials")]
    MissingCredentials(Channel, String),
}

impl SelectionError {
    pub fn reason(&self) -> FailureReason {
        match self {
            SelectionError::NoProvider(_) => FailureReason::NoProvider,
            SelectionError::QuotaExhausted(_) => FailureReason::Quota,
            SelectionError::MissingCredentials(..) => FailureReason::MissingCredentials,
        }
    }
}

/// Usage of one provider against its limits.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub provider_id: Uuid,
    pub name: String,
    pub channel: Channel,
    pub daily_limit: u64,
    pub monthly_limit: u64,
    pub remaining_today: u64,
    pub remaining_this_month: u64,
    #[serde(flatten)]
    pub usage: UsageSnapshot,
}

pub struct ProviderRegistry {
    providers: DashMap<Uuid, ProviderRecord>,
    usage: Arc<dyn UsageCounter>,
    clock: Arc<dyn Clock>,
}

impl ProviderRegistry {
    pub fn new(usage: Arc<dyn UsageCounter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            providers: DashMap::new(),
            usage,
            clock,
        }
    }

    /// Build a registry from configured providers.
    pub fn from_settings(
        settings: Vec<ProviderSettings>,
        usage: Arc<dyn UsageCounter>,
        clock: Arc<dyn Clock>,
    ) -> CampaignResult<Self> {
        let registry = Self::new(usage, clock);
        for provider in settings {
            registry.register(provider)?;
        }
        Ok(registry)
    }

    /// Add or replace a provider. Registering a default clears the default
    /// flag of every other provider on the same channel.
    pub fn register(&self, settings: ProviderSettings) -> CampaignResult<()> {
        settings.validate()?;
        if settings.is_default {
            let channel = settings.channel();
            for mut other in self.providers.iter_mut() {
                if other.id() != settings.id && other.channel() == channel && other.settings.is_default {
                    info!(provider = %other.settings.name, "Clearing previous default provider");
                    other.settings.is_default = false;
                }
            }
        }
        info!(
            provider_id = %settings.id,
            name = %settings.name,
            kind = settings.credentials.kind(),
            channel = %settings.channel(),
            is_default = settings.is_default,
            "Provider registered"
        );
        let record = match self.providers.get(&settings.id) {
            Some(existing) => ProviderRecord {
                settings,
                ..existing.clone()
            },
            None => ProviderRecord::new(settings),
        };
        self.providers.insert(record.id(), record);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<ProviderRecord> {
        self.providers.get(&id).map(|r| r.clone())
    }

    /// Live providers, optionally for one channel, by priority.
    pub fn list(&self, channel: Option<Channel>) -> Vec<ProviderRecord> {
        let mut records: Vec<ProviderRecord> = self
            .providers
            .iter()
            .filter(|r| r.deleted_at.is_none())
            .filter(|r| channel.map_or(true, |c| r.channel() == c))
            .map(|r| r.clone())
            .collect();
        records.sort_by(by_rank);
        records
    }

    fn update<F>(&self, id: Uuid, f: F) -> CampaignResult<ProviderRecord>
    where
        F: FnOnce(&mut ProviderRecord),
    {
        let mut record = self
            .providers
            .get_mut(&id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or_else(|| CampaignError::not_found("provider", id))?;
        f(record.value_mut());
        Ok(record.clone())
    }

    pub fn activate(&self, id: Uuid) -> CampaignResult<ProviderRecord> {
        self.update(id, |r| r.settings.is_active = true)
    }

    pub fn deactivate(&self, id: Uuid) -> CampaignResult<ProviderRecord> {
        self.update(id, |r| r.settings.is_active = false)
    }

    pub fn soft_delete(&self, id: Uuid) -> CampaignResult<ProviderRecord> {
        let now = self.clock.now();
        self.update(id, |r| {
            r.deleted_at = Some(now);
            r.settings.is_active = false;
            r.settings.is_default = false;
        })
    }

    pub fn set_health(&self, id: Uuid, health: HealthStatus) -> CampaignResult<ProviderRecord> {
        let now = self.clock.now();
        self.update(id, |r| {
            if r.health != health {
                info!(provider = %r.settings.name, ?health, "Provider health changed");
            }
            r.health = health;
            r.last_health_check = Some(now);
        })
    }

    /// Pick a provider for `channel` and take one quota slot on it.
    ///
    /// Order: the campaign's pinned provider, then active healthy providers by
    /// priority, then the channel default if its health is still unknown.
    pub async fn select(
        &self,
        channel: Channel,
        preferred: Option<Uuid>,
    ) -> CampaignResult<Result<SelectedProvider, SelectionError>> {
        let now = self.clock.now();
        let candidates = self.list(Some(channel));
        let mut quota_hit = false;

        if let Some(pinned) = preferred.and_then(|id| candidates.iter().find(|r| r.id() == id)) {
            if pinned.is_usable() && pinned.health != HealthStatus::Unhealthy {
                if self.acquire(pinned, now).await? {
                    return Ok(Ok(self.selected(pinned, false, now)));
                }
                quota_hit = true;
            } else {
                debug!(provider = %pinned.settings.name, "Pinned provider unusable, falling back");
            }
        }

        for record in candidates
            .iter()
            .filter(|r| r.is_usable() && r.health == HealthStatus::Healthy)
        {
            if Some(record.id()) == preferred {
                continue;
            }
            if self.acquire(record, now).await? {
                return Ok(Ok(self.selected(record, false, now)));
            }
            quota_hit = true;
        }

        if let Some(default) = candidates.iter().find(|r| {
            r.settings.is_default && r.is_usable() && r.health == HealthStatus::Unknown
        }) {
            if Some(default.id()) != preferred {
                if self.acquire(default, now).await? {
                    warn!(
                        provider = %default.settings.name,
                        "Using default provider with unknown health"
                    );
                    return Ok(Ok(self.selected(default, true, now)));
                }
                quota_hit = true;
            }
        }

        if quota_hit {
            return Ok(Err(SelectionError::QuotaExhausted(channel)));
        }
        let missing = candidates.iter().find(|r| {
            r.settings.is_active && !r.settings.credentials.has_minimum_credentials()
        });
        Ok(Err(match missing {
            Some(r) => SelectionError::MissingCredentials(channel, r.settings.name.clone()),
            None => SelectionError::NoProvider(channel),
        }))
    }

    async fn acquire(&self, record: &ProviderRecord, now: DateTime<Utc>) -> CampaignResult<bool> {
        let s = &record.settings;
        let acquired = self
            .usage
            .try_acquire(s.id, s.daily_limit, s.monthly_limit, now)
            .await?;
        if !acquired {
            debug!(provider = %s.name, "Provider over quota");
            metrics::counter!(
                "providers.quota_rejected",
                "provider" => s.name.clone()
            )
            .increment(1);
        }
        Ok(acquired)
    }

    fn selected(&self, record: &ProviderRecord, degraded: bool, now: DateTime<Utc>) -> SelectedProvider {
        metrics::counter!(
            "providers.selected",
            "channel" => record.channel().as_str(),
            "kind" => record.settings.credentials.kind()
        )
        .increment(1);
        SelectedProvider {
            settings: record.settings.clone(),
            health: record.health,
            degraded,
            acquired_at: now,
        }
    }

    /// Return the quota slot taken by `select` after a send that failed.
    pub async fn release(&self, selected: &SelectedProvider) -> CampaignResult<()> {
        self.usage
            .release(selected.settings.id, selected.acquired_at)
            .await
    }

    pub async fn usage(&self, id: Uuid) -> CampaignResult<ProviderUsage> {
        let record = self
            .get(id)
            .ok_or_else(|| CampaignError::not_found("provider", id))?;
        let usage = self.usage.snapshot(id, self.clock.now()).await?;
        let s = &record.settings;
        Ok(ProviderUsage {
            provider_id: id,
            name: s.name.clone(),
            channel: s.channel(),
            daily_limit: s.daily_limit,
            monthly_limit: s.monthly_limit,
            remaining_today: s.daily_limit.saturating_sub(usage.sent_today),
            remaining_this_month: s.monthly_limit.saturating_sub(usage.sent_this_month),
            usage,
        })
    }

    pub async fn reset_usage(&self, id: Uuid) -> CampaignResult<()> {
        if self.get(id).is_none() {
            return Err(CampaignError::not_found("provider", id));
        }
        info!(provider_id = %id, "Provider usage reset");
        self.usage.reset(id, self.clock.now()).await
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn by_rank(a: &ProviderRecord, b: &ProviderRecord) -> Ordering {
    a.settings
        .priority
        .cmp(&b.settings.priority)
        .then_with(|| b.settings.is_default.cmp(&a.settings.is_default))
        .then_with(|| a.settings.name.cmp(&b.settings.name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::usage::MemoryUsageCounter;
    use campaign_core::clock::SystemClock;
    use campaign_core::providers::{ProviderCredentials, Secret};

    fn make_registry() -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(MemoryUsageCounter::new()), Arc::new(SystemClock))
    }

    fn sms_provider(name: &str, priority: u8, daily_limit: u64) -> ProviderSettings {
        ProviderSettings {
            id: Uuid::new_v4(),
            name: name.to_string(),
            credentials: ProviderCredentials::TwilioSms {
                account_sid: "AC1".to_string(),
                auth_token: Secret::new("tok"),
                from_number: "+15550000000".to_string(),
                status_callback_url: None,
            },
            daily_limit,
            monthly_limit: 10_000,
            priority,
            is_default: false,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_healthy_provider_selected_by_priority() {
        let registry = make_registry();
        let primary = sms_provider("primary", 1, 10);
        let backup = sms_provider("backup", 2, 10);
        registry.register(backup.clone()).unwrap();
        registry.register(primary.clone()).unwrap();
        registry.set_health(primary.id, HealthStatus::Healthy).unwrap();
        registry.set_health(backup.id, HealthStatus::Healthy).unwrap();

        let selected = registry.select(Channel::Sms, None).await.unwrap().unwrap();
        assert_eq!(selected.settings.id, primary.id);
    }

    #[tokio::test]
    async fn test_fails_over_when_primary_over_quota() {
        let registry = make_registry();
        let primary = sms_provider("primary", 1, 1);
        let backup = sms_provider("backup", 2, 10);
        registry.register(primary.clone()).unwrap();
        registry.register(backup.clone()).unwrap();
        registry.set_health(primary.id, HealthStatus::Healthy).unwrap();
        registry.set_health(backup.id, HealthStatus::Healthy).unwrap();

        let first = registry.select(Channel::Sms, None).await.unwrap().unwrap();
        let second = registry.select(Channel::Sms, None).await.unwrap().unwrap();
        assert_eq!(first.settings.id, primary.id);
        assert_eq!(second.settings.id, backup.id);
    }

    #[tokio::test]
    async fn test_unknown_health_default_is_fallback() {
        let registry = make_registry();
        let mut default = sms_provider("default", 1, 10);
        default.is_default = true;
        registry.register(default.clone()).unwrap();

        let selected = registry.select(Channel::Sms, None).await.unwrap().unwrap();
        assert_eq!(selected.settings.id, default.id);
        assert!(selected.degraded);

        registry.set_health(default.id, HealthStatus::Unhealthy).unwrap();
        let err = registry.select(Channel::Sms, None).await.unwrap().unwrap_err();
        assert_eq!(err, SelectionError::NoProvider(Channel::Sms));
    }

    #[tokio::test]
    async fn test_quota_exhaustion_reported() {
        let registry = make_registry();
        let p = sms_provider("only", 1, 1);
        registry.register(p.clone()).unwrap();
        registry.set_health(p.id, HealthStatus::Healthy).unwrap();

        assert!(registry.select(Channel::Sms, None).await.unwrap().is_ok());
        let err = registry.select(Channel::Sms, None).await.unwrap().unwrap_err();
        assert_eq!(err.reason(), FailureReason::Quota);

        let usage = registry.usage(p.id).await.unwrap();
        assert_eq!(usage.usage.sent_today, 1);
        assert_eq!(usage.remaining_today, 0);

        registry.reset_usage(p.id).await.unwrap();
        assert!(registry.select(Channel::Sms, None).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_missing_credentials_reported() {
        let registry = make_registry();
        let mut broken = sms_provider("broken", 1, 10);
        broken.is_active = false;
        broken.credentials = ProviderCredentials::TwilioSms {
            account_sid: String::new(),
            auth_token: Secret::new(""),
            from_number: String::new(),
            status_callback_url: None,
        };
        registry.register(broken.clone()).unwrap();
        registry.activate(broken.id).unwrap();

        let err = registry.select(Channel::Sms, None).await.unwrap().unwrap_err();
        assert_eq!(err.reason(), FailureReason::MissingCredentials);
    }

    #[tokio::test]
    async fn test_pinned_provider_tried_first() {
        let registry = make_registry();
        let primary = sms_provider("primary", 1, 10);
        let pinned = sms_provider("pinned", 5, 10);
        registry.register(primary.clone()).unwrap();
        registry.register(pinned.clone()).unwrap();
        registry.set_health(primary.id, HealthStatus::Healthy).unwrap();

        let selected = registry
            .select(Channel::Sms, Some(pinned.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.settings.id, pinned.id);

        registry.deactivate(pinned.id).unwrap();
        let selected = registry
            .select(Channel::Sms, Some(pinned.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.settings.id, primary.id);
    }

    #[tokio::test]
    async fn test_registering_default_clears_previous() {
        let registry = make_registry();
        let mut a = sms_provider("a", 1, 10);
        a.is_default = true;
        let mut b = sms_provider("b", 1, 10);
        b.is_default = true;
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        assert!(!registry.get(a.id).unwrap().settings.is_default);
        assert!(registry.get(b.id).unwrap().settings.is_default);
    }

    #[tokio::test]
    async fn test_soft_deleted_provider_hidden() {
        let registry = make_registry();
        let p = sms_provider("gone", 1, 10);
        registry.register(p.clone()).unwrap();
        registry.soft_delete(p.id).unwrap();
        assert!(registry.list(Some(Channel::Sms)).is_empty());
        assert!(registry.activate(p.id).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_selection_respects_daily_limit() {
        let registry = Arc::new(make_registry());
        let p = sms_provider("limited", 1, 5);
        registry.register(p.clone()).unwrap();
        registry.set_health(p.id, HealthStatus::Healthy).unwrap();

        let mut handles = Vec::new();
        for _ in 0..40 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.select(Channel::Sms, None).await.unwrap().is_ok()
            }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }
}
