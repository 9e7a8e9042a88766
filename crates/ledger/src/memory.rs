use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::debug;
use uuid::Uuid;

use campaign_core::error::CampaignResult;
use campaign_core::types::{DeliveryStatus, DispatchRecord, LedgerEntry, TaskKey};

use crate::store::{
    apply_escalation, apply_finish, BeginOutcome, EscalationOutcome, FinishOutcome, LedgerStore,
};

/// In-process ledger with an external-id index for webhook lookups.
#[derive(Default)]
pub struct MemoryLedger {
    rows: DashMap<TaskKey, LedgerEntry>,
    by_external_id: DashMap<String, TaskKey>,
    /// (campaign, recipient) pairs with a recorded click or reply.
    engaged: DashSet<(Uuid, Uuid)>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self, entry: LedgerEntry) -> CampaignResult<BeginOutcome> {
        match self.rows.entry(entry.task_key.clone()) {
            Entry::Occupied(existing) => Ok(BeginOutcome::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(BeginOutcome::Inserted)
            }
        }
    }

    async fn get(&self, key: &TaskKey) -> CampaignResult<Option<LedgerEntry>> {
        Ok(self.rows.get(key).map(|e| e.clone()))
    }

    async fn finish(
        &self,
        key: &TaskKey,
        record: DispatchRecord,
        now: DateTime<Utc>,
    ) -> CampaignResult<FinishOutcome> {
        let Some(mut row) = self.rows.get_mut(key) else {
            return Ok(FinishOutcome::Missing);
        };
        let Some(next) = apply_finish(&row, &record, now) else {
            return Ok(FinishOutcome::AlreadyFinished(row.clone()));
        };
        if let Some(external_id) = &next.external_id {
            self.by_external_id.insert(external_id.clone(), key.clone());
        }
        *row = next.clone();
        Ok(FinishOutcome::Finished(next))
    }

    async fn find_by_external_id(&self, external_id: &str) -> CampaignResult<Option<LedgerEntry>> {
        let Some(key) = self.by_external_id.get(external_id).map(|k| k.clone()) else {
            return Ok(None);
        };
        Ok(self.rows.get(&key).map(|e| e.clone()))
    }

    async fn escalate(
        &self,
        key: &TaskKey,
        status: DeliveryStatus,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> CampaignResult<EscalationOutcome> {
        let Some(mut row) = self.rows.get_mut(key) else {
            return Ok(EscalationOutcome::Missing);
        };
        match apply_escalation(&row, status, detail, now) {
            Ok(next) => {
                let from = row.status;
                if next.status.is_engagement() {
                    self.engaged.insert((next.campaign_id, next.recipient_id));
                }
                *row = next.clone();
                debug!(task_key = %key, %from, to = %status, "Ledger row escalated");
                Ok(EscalationOutcome::Applied { from, entry: next })
            }
            Err(current) => Ok(EscalationOutcome::Ignored { current }),
        }
    }

    async fn has_engagement(&self, campaign_id: Uuid, recipient_id: Uuid) -> CampaignResult<bool> {
        Ok(self.engaged.contains(&(campaign_id, recipient_id)))
    }

    async fn list_by_campaign(&self, campaign_id: Uuid) -> CampaignResult<Vec<LedgerEntry>> {
        let mut rows: Vec<LedgerEntry> = self
            .rows
            .iter()
            .filter(|e| e.campaign_id == campaign_id)
            .map(|e| e.clone())
            .collect();
        rows.sort_by(|a, b| {
            a.attempt_started_at
                .cmp(&b.attempt_started_at)
                .then_with(|| a.task_key.cmp(&b.task_key))
        });
        Ok(rows)
    }
}
