//! Domain types shared by every crate of the delivery engine: campaigns and
//! their sequence steps, recipients, scheduled tasks and ledger rows.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Channels ───────────────────────────────────────────────────────────────

/// Outbound messaging channel a step (and a provider) belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Chat,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Chat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Chat => "chat",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "chat" | "whatsapp" => Some(Channel::Chat),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which channels a campaign is allowed to dispatch on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelFlags {
    #[serde(default = "default_true")]
    pub email: bool,
    #[serde(default)]
    pub sms: bool,
    #[serde(default)]
    pub chat: bool,
}

fn default_true() -> bool {
    true
}

impl ChannelFlags {
    pub fn all() -> Self {
        Self {
            email: true,
            sms: true,
            chat: true,
        }
    }

    pub fn is_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.email,
            Channel::Sms => self.sms,
            Channel::Chat => self.chat,
        }
    }
}

impl Default for ChannelFlags {
    fn default() -> Self {
        Self {
            email: true,
            sms: false,
            chat: false,
        }
    }
}

// ─── Campaigns & steps ──────────────────────────────────────────────────────

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule deciding whether a step is suppressed by prior engagement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    #[default]
    Always,
    IfNoResponse,
    IfNoAction,
}

impl TriggerCondition {
    /// Whether a recorded reply/click for the recipient suppresses this step.
    pub fn suppressed_by_engagement(&self) -> bool {
        matches!(self, TriggerCondition::IfNoResponse | TriggerCondition::IfNoAction)
    }
}

/// Delay before a step fires, expressed in the units the campaign editor uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StepDelay {
    #[serde(default)]
    pub minutes: u32,
    #[serde(default)]
    pub hours: u32,
    #[serde(default)]
    pub days: u32,
    #[serde(default)]
    pub weeks: u32,
}

impl StepDelay {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn hours(hours: u32) -> Self {
        Self {
            hours,
            ..Self::default()
        }
    }

    pub fn minutes(minutes: u32) -> Self {
        Self {
            minutes,
            ..Self::default()
        }
    }

    /// All units summed into a single duration.
    pub fn total(&self) -> Duration {
        Duration::minutes(i64::from(self.minutes))
            + Duration::hours(i64::from(self.hours))
            + Duration::days(i64::from(self.days))
            + Duration::weeks(i64::from(self.weeks))
    }
}

/// Message content for a step. Placeholders use `{{name}}` syntax.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentTemplate {
    pub name: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

/// One ordered message of a campaign sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceStep {
    pub id: Uuid,
    pub order: u32,
    pub channel: Channel,
    #[serde(default)]
    pub delay: StepDelay,
    #[serde(default)]
    pub trigger: TriggerCondition,
    pub template: ContentTemplate,
}

/// A multi-step, multi-channel outbound plan targeting one audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub channels: ChannelFlags,
    pub audience_id: Uuid,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    /// Sorted ascending by `order`.
    #[serde(default)]
    pub steps: Vec<SequenceStep>,
    /// Provider pinned per channel; tried before registry selection.
    #[serde(default)]
    pub provider_overrides: HashMap<Channel, Uuid>,
    /// Set on start and cleared once every first step has been scheduled.
    /// A campaign left Active with this set is fanned out again by the sweep.
    #[serde(default)]
    pub fan_out_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn first_step(&self) -> Option<&SequenceStep> {
        self.steps.iter().min_by_key(|s| s.order)
    }

    pub fn step(&self, step_id: Uuid) -> Option<&SequenceStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// The step with the smallest order strictly greater than `order`.
    pub fn next_step_after(&self, order: u32) -> Option<&SequenceStep> {
        self.steps
            .iter()
            .filter(|s| s.order > order)
            .min_by_key(|s| s.order)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ─── Recipients ─────────────────────────────────────────────────────────────

/// Audience contact as seen by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Recipient {
    pub fn is_eligible(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Address used for a channel: email for Email, phone for SMS and chat.
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        let addr = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms | Channel::Chat => self.phone.as_deref(),
        };
        addr.filter(|a| !a.trim().is_empty())
    }
}

// ─── Scheduled tasks ────────────────────────────────────────────────────────

/// Stable identity of "step S for recipient R of campaign C".
///
/// Derived from the triple, so re-creating a task for the same triple always
/// yields the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(campaign_id: Uuid, step_id: Uuid, recipient_id: Uuid) -> Self {
        Self(format!("{campaign_id}:{step_id}:{recipient_id}"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted "fire step S for recipient R at time T" record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledTask {
    pub key: TaskKey,
    pub campaign_id: Uuid,
    pub step_id: Uuid,
    pub recipient_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    /// Parked by a pause; invisible to due polling until re-armed.
    #[serde(default)]
    pub deferred: bool,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn new(
        campaign_id: Uuid,
        step_id: Uuid,
        recipient_id: Uuid,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: TaskKey::new(campaign_id, step_id, recipient_id),
            campaign_id,
            step_id,
            recipient_id,
            scheduled_for,
            deferred: false,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.deferred && self.scheduled_for <= now
    }
}

// ─── Ledger ─────────────────────────────────────────────────────────────────

/// Delivery status of a ledger row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Delivered,
    Opened,
    Clicked,
    Replied,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 7] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Sent,
        DeliveryStatus::Failed,
        DeliveryStatus::Delivered,
        DeliveryStatus::Opened,
        DeliveryStatus::Clicked,
        DeliveryStatus::Replied,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Opened => "opened",
            DeliveryStatus::Clicked => "clicked",
            DeliveryStatus::Replied => "replied",
        }
    }

    /// Position on the engagement ladder. `Failed` has no rank: it is
    /// reachable from anywhere and nothing leaves it.
    pub fn rank(&self) -> Option<u8> {
        match self {
            DeliveryStatus::Pending => Some(0),
            DeliveryStatus::Sent => Some(1),
            DeliveryStatus::Delivered => Some(2),
            DeliveryStatus::Opened => Some(3),
            DeliveryStatus::Clicked => Some(4),
            DeliveryStatus::Replied => Some(5),
            DeliveryStatus::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is a forward move.
    pub fn can_escalate_to(&self, next: DeliveryStatus) -> bool {
        match (self.rank(), next.rank()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(cur), Some(new)) => new > cur,
        }
    }

    /// A reply or click counts as engagement for trigger conditions.
    pub fn is_engagement(&self) -> bool {
        matches!(self, DeliveryStatus::Clicked | DeliveryStatus::Replied)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable failure codes stored on failed ledger rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoProvider,
    MissingCredentials,
    Quota,
    ChannelDisabled,
    MissingAddress,
    VendorRejected,
    Transient,
    Timeout,
    Interrupted,
    Bounced,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::NoProvider => "no_provider",
            FailureReason::MissingCredentials => "missing_credentials",
            FailureReason::Quota => "quota",
            FailureReason::ChannelDisabled => "channel_disabled",
            FailureReason::MissingAddress => "missing_address",
            FailureReason::VendorRejected => "vendor_rejected",
            FailureReason::Transient => "transient",
            FailureReason::Timeout => "timeout",
            FailureReason::Interrupted => "interrupted",
            FailureReason::Bounced => "bounced",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome record of one dispatch attempt for (campaign, step, recipient).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub task_key: TaskKey,
    pub campaign_id: Uuid,
    pub step_id: Uuid,
    pub recipient_id: Uuid,
    pub channel: Channel,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub provider_id: Option<Uuid>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub attempt_started_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// A fresh Pending row, written before the provider is called.
    pub fn pending(task: &ScheduledTask, channel: Channel, now: DateTime<Utc>) -> Self {
        Self {
            task_key: task.key.clone(),
            campaign_id: task.campaign_id,
            step_id: task.step_id,
            recipient_id: task.recipient_id,
            channel,
            status: DeliveryStatus::Pending,
            provider_id: None,
            external_id: None,
            error_code: None,
            error: None,
            attempt_started_at: now,
            sent_at: None,
            updated_at: now,
        }
    }
}

/// How a Pending row is finished once the provider call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchRecord {
    Sent {
        provider_id: Uuid,
        external_id: Option<String>,
    },
    Failed {
        provider_id: Option<Uuid>,
        reason: FailureReason,
        message: String,
    },
}

/// Per-status counts for one campaign.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub replied: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Pending => self.pending += 1,
            DeliveryStatus::Sent => self.sent += 1,
            DeliveryStatus::Failed => self.failed += 1,
            DeliveryStatus::Delivered => self.delivered += 1,
            DeliveryStatus::Opened => self.opened += 1,
            DeliveryStatus::Clicked => self.clicked += 1,
            DeliveryStatus::Replied => self.replied += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending
            + self.sent
            + self.failed
            + self.delivered
            + self.opened
            + self.clicked
            + self.replied
    }
}
