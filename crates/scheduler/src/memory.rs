//! In-process task store backed by DashMap. Used for single-node runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use campaign_core::error::CampaignResult;
use campaign_core::types::{ScheduledTask, TaskKey};

use crate::store::TaskStore;

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Slot {
    task: ScheduledTask,
    lease: Option<Lease>,
}

impl Slot {
    fn leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.until > now)
    }
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: DashMap<TaskKey, Slot>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn keys_for(&self, campaign_id: Uuid) -> Vec<TaskKey> {
        self.tasks
            .iter()
            .filter(|e| e.value().task.campaign_id == campaign_id)
            .map(|e| e.key().clone())
            .collect()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn schedule(&self, task: ScheduledTask) -> CampaignResult<bool> {
        use dashmap::mapref::entry::Entry;
        match self.tasks.entry(task.key.clone()) {
            Entry::Occupied(_) => {
                debug!(task_key = %task.key, "Task already scheduled");
                Ok(false)
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot { task, lease: None });
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &TaskKey) -> CampaignResult<Option<ScheduledTask>> {
        Ok(self.tasks.get(key).map(|s| s.task.clone()))
    }

    async fn cancel(&self, key: &TaskKey) -> CampaignResult<bool> {
        Ok(self.tasks.remove(key).is_some())
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CampaignResult<Vec<ScheduledTask>> {
        let mut due: Vec<ScheduledTask> = self
            .tasks
            .iter()
            .filter(|e| e.value().task.is_due(now) && !e.value().leased_at(now))
            .map(|e| e.value().task.clone())
            .collect();
        due.sort_by_key(|t| t.scheduled_for);
        due.truncate(limit);
        Ok(due)
    }

    async fn list_by_campaign(&self, campaign_id: Uuid) -> CampaignResult<Vec<ScheduledTask>> {
        let mut tasks: Vec<ScheduledTask> = self
            .tasks
            .iter()
            .filter(|e| e.value().task.campaign_id == campaign_id)
            .map(|e| e.value().task.clone())
            .collect();
        tasks.sort_by_key(|t| t.scheduled_for);
        Ok(tasks)
    }

    async fn claim(
        &self,
        key: &TaskKey,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> CampaignResult<Option<ScheduledTask>> {
        // get_mut holds the shard write lock for the whole check-and-set.
        let Some(mut slot) = self.tasks.get_mut(key) else {
            return Ok(None);
        };
        if !slot.task.is_due(now) || slot.leased_at(now) {
            return Ok(None);
        }
        slot.lease = Some(Lease {
            worker_id: worker_id.to_string(),
            until: lease_until,
        });
        debug!(task_key = %key, worker_id, "Task claimed");
        Ok(Some(slot.task.clone()))
    }

    async fn complete(&self, key: &TaskKey) -> CampaignResult<bool> {
        if let Some((_, slot)) = self.tasks.remove(key) {
            if let Some(lease) = slot.lease {
                debug!(task_key = %key, worker_id = %lease.worker_id, "Task completed");
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn defer(&self, key: &TaskKey) -> CampaignResult<bool> {
        match self.tasks.get_mut(key) {
            Some(mut slot) => {
                slot.task.deferred = true;
                slot.lease = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn defer_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        let mut parked = 0;
        for key in self.keys_for(campaign_id) {
            if let Some(mut slot) = self.tasks.get_mut(&key) {
                if !slot.task.deferred {
                    slot.task.deferred = true;
                    parked += 1;
                }
            }
        }
        Ok(parked)
    }

    async fn resume_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        let mut armed = 0;
        for key in self.keys_for(campaign_id) {
            if let Some(mut slot) = self.tasks.get_mut(&key) {
                if slot.task.deferred {
                    slot.task.deferred = false;
                    armed += 1;
                }
            }
        }
        Ok(armed)
    }

    async fn cancel_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        let before = self.tasks.len();
        self.tasks.retain(|_, slot| slot.task.campaign_id != campaign_id);
        Ok(before - self.tasks.len())
    }

    async fn count_by_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        Ok(self
            .tasks
            .iter()
            .filter(|e| e.value().task.campaign_id == campaign_id)
            .count())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn make_task(campaign_id: Uuid, fire_at: DateTime<Utc>) -> ScheduledTask {
        ScheduledTask::new(campaign_id, Uuid::new_v4(), Uuid::new_v4(), fire_at, fire_at)
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent_per_key() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let task = make_task(Uuid::new_v4(), now);

        assert!(store.schedule(task.clone()).await.unwrap());
        let mut again = task.clone();
        again.scheduled_for = now + Duration::hours(3);
        assert!(!store.schedule(again).await.unwrap());

        assert_eq!(store.len(), 1);
        let stored = store.get(&task.key).await.unwrap().unwrap();
        assert_eq!(stored.scheduled_for, now);
    }

    #[tokio::test]
    async fn test_list_due_orders_and_limits() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let campaign = Uuid::new_v4();
        let late = make_task(campaign, now - Duration::seconds(1));
        let early = make_task(campaign, now - Duration::minutes(5));
        let future = make_task(campaign, now + Duration::minutes(5));
        for t in [&late, &early, &future] {
            store.schedule(t.clone()).await.unwrap();
        }

        let due = store.list_due(now, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].key, early.key);

        let due = store.list_due(now, 1).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_lease_expires() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let task = make_task(Uuid::new_v4(), now);
        store.schedule(task.clone()).await.unwrap();

        let lease = now + Duration::seconds(60);
        assert!(store.claim(&task.key, "w1", now, lease).await.unwrap().is_some());
        assert!(store.claim(&task.key, "w2", now, lease).await.unwrap().is_none());
        assert!(store.list_due(now, 10).await.unwrap().is_empty());

        // Lease lapsed: the task is redelivered.
        let later = now + Duration::seconds(61);
        assert_eq!(store.list_due(later, 10).await.unwrap().len(), 1);
        assert!(store
            .claim(&task.key, "w2", later, later + Duration::seconds(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let store = Arc::new(MemoryTaskStore::new());
        let now = Utc::now();
        let task = make_task(Uuid::new_v4(), now);
        store.schedule(task.clone()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let key = task.key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim(&key, &format!("w{i}"), now, now + Duration::seconds(30))
                    .await
                    .unwrap()
                    .is_some()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_defer_and_resume_campaign_conserves_tasks() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let campaign = Uuid::new_v4();
        let other = Uuid::new_v4();
        for _ in 0..3 {
            store.schedule(make_task(campaign, now)).await.unwrap();
        }
        store.schedule(make_task(other, now)).await.unwrap();

        assert_eq!(store.defer_campaign(campaign).await.unwrap(), 3);
        assert_eq!(store.count_by_campaign(campaign).await.unwrap(), 3);
        let due = store.list_due(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].campaign_id, other);

        assert_eq!(store.resume_campaign(campaign).await.unwrap(), 3);
        assert_eq!(store.list_due(now, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_deferred_task_cannot_be_claimed() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let task = make_task(Uuid::new_v4(), now);
        store.schedule(task.clone()).await.unwrap();
        assert!(store.defer(&task.key).await.unwrap());
        assert!(store
            .claim(&task.key, "w1", now, now + Duration::seconds(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_campaign_removes_only_that_campaign() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let campaign = Uuid::new_v4();
        store.schedule(make_task(campaign, now)).await.unwrap();
        store.schedule(make_task(campaign, now)).await.unwrap();
        store.schedule(make_task(Uuid::new_v4(), now)).await.unwrap();

        assert_eq!(store.cancel_campaign(campaign).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }
}
