//! Delivery event bus: trait for emitting lifecycle and delivery events
//! from the orchestrator and the webhook reconciler.
//!
//! Modules accept an `Arc<dyn EventSink>`; the binary wires a tracing-backed
//! sink, tests use `CaptureSink`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::types::{Channel, DeliveryStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventType {
    CampaignStarted,
    CampaignPaused,
    CampaignResumed,
    CampaignCompleted,
    StepScheduled,
    StepSent,
    StepFailed,
    StepSkipped,
    StepDeferred,
    StatusReconciled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub event_id: Uuid,
    pub event_type: DeliveryEventType,
    pub campaign_id: Uuid,
    pub step_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub channel: Option<Channel>,
    pub status: Option<DeliveryStatus>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting delivery events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DeliveryEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: DeliveryEvent) {}
}

/// Writes every event as a structured log line.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: DeliveryEvent) {
        info!(
            event_type = ?event.event_type,
            campaign_id = %event.campaign_id,
            step_id = ?event.step_id,
            recipient_id = ?event.recipient_id,
            status = ?event.status,
            detail = event.detail.as_deref().unwrap_or(""),
            "delivery event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: DeliveryEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: DeliveryEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for a campaign-level event.
pub fn make_event(event_type: DeliveryEventType, campaign_id: Uuid) -> DeliveryEvent {
    DeliveryEvent {
        event_id: Uuid::new_v4(),
        event_type,
        campaign_id,
        step_id: None,
        recipient_id: None,
        channel: None,
        status: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

impl DeliveryEvent {
    pub fn for_step(mut self, step_id: Uuid, recipient_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self.recipient_id = Some(recipient_id);
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let campaign_id = Uuid::new_v4();
        sink.emit(make_event(DeliveryEventType::CampaignStarted, campaign_id));
        sink.emit(
            make_event(DeliveryEventType::StepSent, campaign_id)
                .for_step(Uuid::new_v4(), Uuid::new_v4())
                .with_status(DeliveryStatus::Sent),
        );

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(DeliveryEventType::CampaignStarted), 1);
        assert_eq!(sink.count_type(DeliveryEventType::StepSent), 1);

        let events = sink.events();
        assert_eq!(events[1].status, Some(DeliveryStatus::Sent));
        assert!(events[1].recipient_id.is_some());
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(DeliveryEventType::StepSkipped, Uuid::new_v4()));
    }
}
