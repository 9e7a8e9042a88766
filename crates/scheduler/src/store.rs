use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use campaign_core::error::CampaignResult;
use campaign_core::types::{ScheduledTask, TaskKey};

/// Persistence contract for scheduled tasks.
///
/// A task is "live" from `schedule` until `complete` or `cancel`. Deferred
/// tasks stay live but are invisible to `list_due` and `claim`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task. Returns `false` without touching anything when a task
    /// with the same key is already live.
    async fn schedule(&self, task: ScheduledTask) -> CampaignResult<bool>;

    async fn get(&self, key: &TaskKey) -> CampaignResult<Option<ScheduledTask>>;

    /// Delete a live task. Returns whether one existed.
    async fn cancel(&self, key: &TaskKey) -> CampaignResult<bool>;

    /// Due, non-deferred, unleased tasks, oldest first.
    async fn list_due(&self, now: DateTime<Utc>, limit: usize)
        -> CampaignResult<Vec<ScheduledTask>>;

    async fn list_by_campaign(&self, campaign_id: Uuid) -> CampaignResult<Vec<ScheduledTask>>;

    /// Take an exclusive lease on a due task. At most one caller gets
    /// `Some` while the lease is live.
    async fn claim(
        &self,
        key: &TaskKey,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> CampaignResult<Option<ScheduledTask>>;

    /// Remove a task after its execution finished.
    async fn complete(&self, key: &TaskKey) -> CampaignResult<bool>;

    /// Park one task and drop its lease.
    async fn defer(&self, key: &TaskKey) -> CampaignResult<bool>;

    /// Park every live task of a campaign. Returns how many were parked.
    async fn defer_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize>;

    /// Re-arm every parked task of a campaign with its original fire time.
    async fn resume_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize>;

    /// Delete every live task of a campaign.
    async fn cancel_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize>;

    async fn count_by_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize>;
}
