use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use campaign_core::error::CampaignResult;
use campaign_core::types::{
    DeliveryStatus, DispatchRecord, FailureReason, LedgerEntry, StatusCounts, TaskKey,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// A new Pending row was written; the caller owns the send.
    Inserted,
    /// A row for this task already exists.
    Existing(LedgerEntry),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    Finished(LedgerEntry),
    /// The row had already left Pending; nothing was written.
    AlreadyFinished(LedgerEntry),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    Applied {
        from: DeliveryStatus,
        entry: LedgerEntry,
    },
    /// The event would not move the row forward.
    Ignored { current: DeliveryStatus },
    Missing,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a Pending row unless one exists for the same task key.
    async fn begin(&self, entry: LedgerEntry) -> CampaignResult<BeginOutcome>;

    async fn get(&self, key: &TaskKey) -> CampaignResult<Option<LedgerEntry>>;

    /// Move a Pending row to Sent or Failed.
    async fn finish(
        &self,
        key: &TaskKey,
        record: DispatchRecord,
        now: DateTime<Utc>,
    ) -> CampaignResult<FinishOutcome>;

    async fn find_by_external_id(&self, external_id: &str) -> CampaignResult<Option<LedgerEntry>>;

    /// Atomically advance a row if `status` is a forward move from its
    /// current status.
    async fn escalate(
        &self,
        key: &TaskKey,
        status: DeliveryStatus,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> CampaignResult<EscalationOutcome>;

    /// Whether any row of this campaign shows a click or reply by the recipient.
    async fn has_engagement(&self, campaign_id: Uuid, recipient_id: Uuid) -> CampaignResult<bool>;

    async fn list_by_campaign(&self, campaign_id: Uuid) -> CampaignResult<Vec<LedgerEntry>>;

    async fn counts_by_status(&self, campaign_id: Uuid) -> CampaignResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for entry in self.list_by_campaign(campaign_id).await? {
            counts.add(entry.status);
        }
        Ok(counts)
    }
}

/// The row after finishing, or `None` when it is no longer Pending.
pub(crate) fn apply_finish(
    entry: &LedgerEntry,
    record: &DispatchRecord,
    now: DateTime<Utc>,
) -> Option<LedgerEntry> {
    if entry.status != DeliveryStatus::Pending {
        return None;
    }
    let mut next = entry.clone();
    next.updated_at = now;
    match record {
        DispatchRecord::Sent {
            provider_id,
            external_id,
        } => {
            next.status = DeliveryStatus::Sent;
            next.provider_id = Some(*provider_id);
            next.external_id = external_id.clone();
            next.sent_at = Some(now);
            next.error_code = None;
            next.error = None;
        }
        DispatchRecord::Failed {
            provider_id,
            reason,
            message,
        } => {
            next.status = DeliveryStatus::Failed;
            next.provider_id = *provider_id;
            next.error_code = Some(reason.code().to_string());
            next.error = Some(message.clone());
        }
    }
    Some(next)
}

/// The row after a webhook status, or the current status when the move
/// would not go forward.
pub(crate) fn apply_escalation(
    entry: &LedgerEntry,
    status: DeliveryStatus,
    detail: Option<String>,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, DeliveryStatus> {
    if !entry.status.can_escalate_to(status) {
        return Err(entry.status);
    }
    let mut next = entry.clone();
    next.status = status;
    next.updated_at = now;
    if status == DeliveryStatus::Failed {
        next.error_code = Some(FailureReason::Bounced.code().to_string());
        next.error = detail.or_else(|| Some("reported failed by provider".to_string()));
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::types::{Channel, ScheduledTask};

    fn pending_entry() -> LedgerEntry {
        let now = Utc::now();
        let task = ScheduledTask::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), now, now);
        LedgerEntry::pending(&task, Channel::Email, now)
    }

    #[test]
    fn test_finish_only_from_pending() {
        let entry = pending_entry();
        let provider_id = Uuid::new_v4();
        let sent = apply_finish(
            &entry,
            &DispatchRecord::Sent {
                provider_id,
                external_id: Some("sg1".to_string()),
            },
            Utc::now(),
        )
        .unwrap_or_else(|| panic!("pending row should finish"));
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert_eq!(sent.provider_id, Some(provider_id));
        assert!(sent.sent_at.is_some());

        let again = apply_finish(
            &sent,
            &DispatchRecord::Failed {
                provider_id: None,
                reason: FailureReason::Interrupted,
                message: "late".to_string(),
            },
            Utc::now(),
        );
        assert!(again.is_none());
    }

    #[test]
    fn test_escalation_rejects_regression() {
        let mut entry = pending_entry();
        entry.status = DeliveryStatus::Clicked;
        assert_eq!(
            apply_escalation(&entry, DeliveryStatus::Opened, None, Utc::now()),
            Err(DeliveryStatus::Clicked)
        );
        let failed = apply_escalation(
            &entry,
            DeliveryStatus::Failed,
            Some("bounce".to_string()),
            Utc::now(),
        )
        .unwrap_or_else(|current| panic!("failed should be reachable from {current}"));
        assert_eq!(failed.error_code.as_deref(), Some("bounced"));
        assert_eq!(
            apply_escalation(&failed, DeliveryStatus::Replied, None, Utc::now()),
            Err(DeliveryStatus::Failed)
        );
    }
}
