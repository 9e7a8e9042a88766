//! Audience contract: who a campaign targets.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::Recipient;

#[async_trait]
pub trait AudienceSource: Send + Sync {
    /// Recipients of an audience that may be contacted. Soft-deleted and
    /// excluded contacts are already filtered out.
    async fn list_eligible(&self, audience_id: Uuid) -> CampaignResult<Vec<Recipient>>;

    async fn get_recipient(&self, recipient_id: Uuid) -> CampaignResult<Option<Recipient>>;
}

#[derive(Debug, Deserialize)]
struct SeedAudience {
    id: Uuid,
    #[serde(default)]
    recipients: Vec<Recipient>,
}

/// In-process audiences, optionally seeded from a JSON file.
#[derive(Default)]
pub struct MemoryAudience {
    members: DashMap<Uuid, Vec<Uuid>>,
    recipients: DashMap<Uuid, Recipient>,
}

impl MemoryAudience {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `[{"id": ..., "recipients": [...]}, ...]`.
    pub fn from_seed_file(path: impl AsRef<Path>) -> CampaignResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CampaignError::Config(format!("cannot read audience seed {}: {e}", path.display()))
        })?;
        let seeds: Vec<SeedAudience> = serde_json::from_str(&raw)?;
        let audience = Self::new();
        for seed in seeds {
            audience.replace_members(seed.id, seed.recipients);
        }
        info!(
            audiences = audience.members.len(),
            recipients = audience.recipients.len(),
            "Audience seed loaded"
        );
        Ok(audience)
    }

    pub fn add_recipient(&self, audience_id: Uuid, recipient: Recipient) {
        let mut members = self.members.entry(audience_id).or_default();
        if !members.contains(&recipient.id) {
            members.push(recipient.id);
        }
        self.recipients.insert(recipient.id, recipient);
    }

    /// Replace an audience's membership. Returns the new member count.
    pub fn replace_members(&self, audience_id: Uuid, recipients: Vec<Recipient>) -> usize {
        let ids: Vec<Uuid> = recipients.iter().map(|r| r.id).collect();
        for recipient in recipients {
            self.recipients.insert(recipient.id, recipient);
        }
        let count = ids.len();
        self.members.insert(audience_id, ids);
        count
    }

    /// Soft-delete a recipient everywhere it appears.
    pub fn remove_recipient(&self, recipient_id: Uuid, now: chrono::DateTime<chrono::Utc>) {
        if let Some(mut r) = self.recipients.get_mut(&recipient_id) {
            r.deleted_at = Some(now);
        }
    }
}

#[async_trait]
impl AudienceSource for MemoryAudience {
    async fn list_eligible(&self, audience_id: Uuid) -> CampaignResult<Vec<Recipient>> {
        let Some(ids) = self.members.get(&audience_id).map(|m| m.clone()) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.recipients.get(id).map(|r| r.clone()))
            .filter(Recipient::is_eligible)
            .collect())
    }

    async fn get_recipient(&self, recipient_id: Uuid) -> CampaignResult<Option<Recipient>> {
        Ok(self.recipients.get(&recipient_id).map(|r| r.clone()))
    }
}
