//! Applies parsed vendor webhook events to ledger rows.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use campaign_core::clock::Clock;
use campaign_core::error::CampaignResult;
use campaign_core::event_bus::{make_event, DeliveryEventType, EventSink};
use campaign_core::types::Channel;

use crate::store::{EscalationOutcome, LedgerStore};
use crate::webhook::{parse_webhook, WebhookEvent, WebhookParseError};

/// Per-request tally returned to the webhook handler.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub received: usize,
    pub applied: usize,
    pub stale_ignored: usize,
    pub unmatched: usize,
    pub ignored: usize,
    pub unrecognized: usize,
    pub errors: usize,
}

pub struct WebhookReconciler {
    ledger: Arc<dyn LedgerStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl WebhookReconciler {
    pub fn new(ledger: Arc<dyn LedgerStore>, events: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            events,
            clock,
        }
    }

    /// Parse and apply one webhook body. Only a structurally broken body is
    /// an error; unknown ids and stale events are counted and dropped.
    pub async fn reconcile(
        &self,
        channel: Channel,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<ReconcileReport, WebhookParseError> {
        let batch = match parse_webhook(channel, body, content_type) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Unparseable webhook payload");
                metrics::counter!("webhooks.events", "channel" => channel.as_str(), "outcome" => "malformed")
                    .increment(1);
                return Err(e);
            }
        };

        let mut report = ReconcileReport {
            received: batch.events.len() + batch.ignored + batch.unrecognized,
            ignored: batch.ignored,
            unrecognized: batch.unrecognized,
            ..ReconcileReport::default()
        };

        for event in &batch.events {
            let outcome = match self.apply(event).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        channel = %channel,
                        external_id = %event.external_id,
                        error = %e,
                        "Ledger update for webhook event failed"
                    );
                    "error"
                }
            };
            match outcome {
                "applied" => report.applied += 1,
                "stale" => report.stale_ignored += 1,
                "unmatched" => report.unmatched += 1,
                _ => report.errors += 1,
            }
            metrics::counter!("webhooks.events", "channel" => channel.as_str(), "outcome" => outcome)
                .increment(1);
        }

        info!(
            channel = %channel,
            received = report.received,
            applied = report.applied,
            stale = report.stale_ignored,
            unmatched = report.unmatched,
            "Webhook reconciled"
        );
        Ok(report)
    }

    async fn apply(&self, event: &WebhookEvent) -> CampaignResult<&'static str> {
        let Some(entry) = self.ledger.find_by_external_id(&event.external_id).await? else {
            warn!(
                external_id = %event.external_id,
                vendor_event = %event.vendor_event,
                "Webhook event for unknown message dropped"
            );
            return Ok("unmatched");
        };

        let now = self.clock.now();
        match self
            .ledger
            .escalate(&entry.task_key, event.status, event.detail.clone(), now)
            .await?
        {
            EscalationOutcome::Applied { from, entry } => {
                debug!(
                    task_key = %entry.task_key,
                    %from,
                    to = %entry.status,
                    "Ledger status escalated"
                );
                let mut delivery_event = make_event(DeliveryEventType::StatusReconciled, entry.campaign_id)
                    .for_step(entry.step_id, entry.recipient_id)
                    .with_channel(entry.channel)
                    .with_status(entry.status);
                if let Some(detail) = &event.detail {
                    delivery_event = delivery_event.with_detail(detail.clone());
                }
                self.events.emit(delivery_event);
                Ok("applied")
            }
            EscalationOutcome::Ignored { current } => {
                debug!(
                    task_key = %entry.task_key,
                    %current,
                    incoming = %event.status,
                    "Stale webhook status ignored"
                );
                Ok("stale")
            }
            EscalationOutcome::Missing => Ok("unmatched"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryLedger;
    use campaign_core::clock::SystemClock;
    use campaign_core::event_bus::CaptureSink;
    use campaign_core::types::{DeliveryStatus, DispatchRecord, LedgerEntry, ScheduledTask};
    use chrono::Utc;
    use uuid::Uuid;

    async fn ledger_with_sent(external_id: &str) -> (Arc<MemoryLedger>, LedgerEntry) {
        let ledger = Arc::new(MemoryLedger::new());
        let now = Utc::now();
        let task = ScheduledTask::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), now, now);
        let entry = LedgerEntry::pending(&task, Channel::Sms, now);
        ledger.begin(entry.clone()).await.unwrap();
        ledger
            .finish(
                &entry.task_key,
                DispatchRecord::Sent {
                    provider_id: Uuid::new_v4(),
                    external_id: Some(external_id.to_string()),
                },
                now,
            )
            .await
            .unwrap();
        (ledger, entry)
    }

    #[tokio::test]
    async fn test_reconcile_applies_and_ignores_stale() {
        let (ledger, entry) = ledger_with_sent("SM42").await;
        let sink = Arc::new(CaptureSink::new());
        let reconciler = WebhookReconciler::new(ledger.clone(), sink.clone(), Arc::new(SystemClock));

        let report = reconciler
            .reconcile(Channel::Sms, b"MessageSid=SM42&MessageStatus=read", None)
            .await
            .unwrap();
        assert_eq!(report.applied, 1);

        let report = reconciler
            .reconcile(Channel::Sms, b"MessageSid=SM42&MessageStatus=delivered", None)
            .await
            .unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.stale_ignored, 1);

        let row = ledger.get(&entry.task_key).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Opened);
        assert_eq!(sink.count_type(DeliveryEventType::StatusReconciled), 1);
    }

    #[tokio::test]
    async fn test_unknown_external_id_touches_nothing() {
        let (ledger, entry) = ledger_with_sent("SM1").await;
        let reconciler = WebhookReconciler::new(
            ledger.clone(),
            Arc::new(CaptureSink::new()),
            Arc::new(SystemClock),
        );
        let report = reconciler
            .reconcile(Channel::Sms, b"MessageSid=SM-unknown&MessageStatus=delivered", None)
            .await
            .unwrap();
        assert_eq!(report.unmatched, 1);
        assert_eq!(ledger.len(), 1);
        let row = ledger.get(&entry.task_key).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_error() {
        let reconciler = WebhookReconciler::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(CaptureSink::new()),
            Arc::new(SystemClock),
        );
        assert!(reconciler
            .reconcile(Channel::Email, b"not json", None)
            .await
            .is_err());
    }
}
