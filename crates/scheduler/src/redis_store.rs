//! Redis-backed task store for multi-node deployments.
//!
//! Layout under `{prefix}`:
//! - `{prefix}:task:{key}`      task JSON, created with SETNX
//! - `{prefix}:due`             ZSET of armed task keys scored by fire time (ms)
//! - `{prefix}:parked`          ZSET of deferred task keys, same scores
//! - `{prefix}:campaign:{id}`   SET of live task keys per campaign
//! - `{prefix}:lease:{key}`     worker id, SET NX PX
//!
//! Every multi-key mutation runs as a Lua script so it is atomic on the server.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};
use uuid::Uuid;

use campaign_core::config::RedisConfig;
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::{ScheduledTask, TaskKey};

use crate::store::TaskStore;

/// Open a managed connection and verify it with PING.
pub async fn connect(config: &RedisConfig) -> CampaignResult<ConnectionManager> {
    info!(url = %config.url, "Connecting to Redis");
    let client = redis::Client::open(config.url.as_str()).map_err(CampaignError::store)?;
    let connecting = ConnectionManager::new(client);
    let mut conn = tokio::time::timeout(
        StdDuration::from_millis(config.connect_timeout_ms),
        connecting,
    )
    .await
    .map_err(|_| CampaignError::Store(format!("timed out connecting to {}", config.url)))?
    .map_err(CampaignError::store)?;

    let pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(CampaignError::store)?;
    info!(response = %pong, "Redis connection established");
    Ok(conn)
}

const SCHEDULE_LUA: &str = r#"
if redis.call('SETNX', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if ARGV[4] == '1' then
  redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
else
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
end
redis.call('SADD', KEYS[4], ARGV[3])
return 1
"#;

const LIST_DUE_LUA: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local out = {}
for _, m in ipairs(members) do
  if redis.call('EXISTS', ARGV[3] .. ':lease:' .. m) == 0 then
    local body = redis.call('GET', ARGV[3] .. ':task:' .. m)
    if body then
      table.insert(out, body)
    end
  end
end
return out
"#;

const CLAIM_LUA: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) > tonumber(ARGV[2]) then
  return false
end
if not redis.call('SET', KEYS[2], ARGV[4], 'NX', 'PX', ARGV[3]) then
  return false
end
return redis.call('GET', KEYS[3])
"#;

const REMOVE_LUA: &str = r#"
local existed = redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('SREM', KEYS[4], ARGV[1])
redis.call('DEL', KEYS[5])
return existed
"#;

const DEFER_LUA: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
  return redis.call('ZSCORE', KEYS[2], ARGV[1]) and 1 or 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], score, ARGV[1])
redis.call('DEL', KEYS[3])
return 1
"#;

// KEYS[2] is the source ZSET, KEYS[3] the destination.
const MOVE_CAMPAIGN_LUA: &str = r#"
local moved = 0
for _, m in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local score = redis.call('ZSCORE', KEYS[2], m)
  if score then
    redis.call('ZREM', KEYS[2], m)
    redis.call('ZADD', KEYS[3], score, m)
    moved = moved + 1
  end
end
return moved
"#;

const CANCEL_CAMPAIGN_LUA: &str = r#"
local removed = 0
for _, m in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  removed = removed + redis.call('DEL', ARGV[1] .. ':task:' .. m)
  redis.call('ZREM', KEYS[2], m)
  redis.call('ZREM', KEYS[3], m)
  redis.call('DEL', ARGV[1] .. ':lease:' .. m)
end
redis.call('DEL', KEYS[1])
return removed
"#;

const LIST_CAMPAIGN_LUA: &str = r#"
local out = {}
for _, m in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local body = redis.call('GET', ARGV[1] .. ':task:' .. m)
  if body then
    table.insert(out, body)
    if redis.call('ZSCORE', KEYS[2], m) then
      table.insert(out, '1')
    else
      table.insert(out, '0')
    end
  end
end
return out
"#;

pub struct RedisTaskStore {
    conn: ConnectionManager,
    prefix: String,
    /// Due candidates fetched per poll, relative to the caller's limit, so
    /// leased tasks at the head of the queue do not starve the rest.
    overscan: usize,
}

impl RedisTaskStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            overscan: 4,
        }
    }

    fn task_key(&self, key: &TaskKey) -> String {
        format!("{}:task:{}", self.prefix, key)
    }

    fn lease_key(&self, key: &TaskKey) -> String {
        format!("{}:lease:{}", self.prefix, key)
    }

    fn due_key(&self) -> String {
        format!("{}:due", self.prefix)
    }

    fn parked_key(&self) -> String {
        format!("{}:parked", self.prefix)
    }

    fn campaign_key(&self, campaign_id: Uuid) -> String {
        format!("{}:campaign:{}", self.prefix, campaign_id)
    }

    fn decode(body: &str, deferred: bool) -> CampaignResult<ScheduledTask> {
        let mut task: ScheduledTask = serde_json::from_str(body)?;
        task.deferred = deferred;
        Ok(task)
    }

    async fn remove(&self, key: &TaskKey, campaign_id: Uuid) -> CampaignResult<bool> {
        let mut conn = self.conn.clone();
        let existed: i64 = Script::new(REMOVE_LUA)
            .key(self.task_key(key))
            .key(self.due_key())
            .key(self.parked_key())
            .key(self.campaign_key(campaign_id))
            .key(self.lease_key(key))
            .arg(key.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        Ok(existed > 0)
    }

    async fn move_campaign(
        &self,
        campaign_id: Uuid,
        from: String,
        to: String,
    ) -> CampaignResult<usize> {
        let mut conn = self.conn.clone();
        let moved: i64 = Script::new(MOVE_CAMPAIGN_LUA)
            .key(self.campaign_key(campaign_id))
            .key(from)
            .key(to)
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        Ok(usize::try_from(moved).unwrap_or(0))
    }

    /// The campaign id is the first segment of a task key.
    fn campaign_of(key: &TaskKey) -> CampaignResult<Uuid> {
        key.as_str()
            .split(':')
            .next()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| CampaignError::Validation(format!("malformed task key {key}")))
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn schedule(&self, task: ScheduledTask) -> CampaignResult<bool> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(&task)?;
        let inserted: i64 = Script::new(SCHEDULE_LUA)
            .key(self.task_key(&task.key))
            .key(self.due_key())
            .key(self.parked_key())
            .key(self.campaign_key(task.campaign_id))
            .arg(body)
            .arg(task.scheduled_for.timestamp_millis())
            .arg(task.key.as_str())
            .arg(if task.deferred { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        if inserted == 0 {
            debug!(task_key = %task.key, "Task already scheduled");
        }
        Ok(inserted == 1)
    }

    async fn get(&self, key: &TaskKey) -> CampaignResult<Option<ScheduledTask>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .get(self.task_key(key))
            .await
            .map_err(CampaignError::store)?;
        let Some(body) = body else {
            return Ok(None);
        };
        let parked: Option<f64> = conn
            .zscore(self.parked_key(), key.as_str())
            .await
            .map_err(CampaignError::store)?;
        Self::decode(&body, parked.is_some()).map(Some)
    }

    async fn cancel(&self, key: &TaskKey) -> CampaignResult<bool> {
        let campaign_id = Self::campaign_of(key)?;
        self.remove(key, campaign_id).await
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CampaignResult<Vec<ScheduledTask>> {
        let mut conn = self.conn.clone();
        let bodies: Vec<String> = Script::new(LIST_DUE_LUA)
            .key(self.due_key())
            .arg(now.timestamp_millis())
            .arg(limit.saturating_mul(self.overscan))
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        let mut due = bodies
            .iter()
            .map(|b| Self::decode(b, false))
            .collect::<CampaignResult<Vec<_>>>()?;
        due.truncate(limit);
        Ok(due)
    }

    async fn list_by_campaign(&self, campaign_id: Uuid) -> CampaignResult<Vec<ScheduledTask>> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = Script::new(LIST_CAMPAIGN_LUA)
            .key(self.campaign_key(campaign_id))
            .key(self.parked_key())
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        let mut tasks = flat
            .chunks(2)
            .filter(|pair| pair.len() == 2)
            .map(|pair| Self::decode(&pair[0], pair[1] == "1"))
            .collect::<CampaignResult<Vec<_>>>()?;
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
        let lease_ms = (lease_until - now).num_milliseconds().max(1);
        let mut conn = self.conn.clone();
        let body: Option<String> = Script::new(CLAIM_LUA)
            .key(self.due_key())
            .key(self.lease_key(key))
            .key(self.task_key(key))
            .arg(key.as_str())
            .arg(now.timestamp_millis())
            .arg(lease_ms)
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        match body {
            Some(body) => {
                debug!(task_key = %key, worker_id, "Task claimed");
                Self::decode(&body, false).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, key: &TaskKey) -> CampaignResult<bool> {
        let campaign_id = Self::campaign_of(key)?;
        self.remove(key, campaign_id).await
    }

    async fn defer(&self, key: &TaskKey) -> CampaignResult<bool> {
        let mut conn = self.conn.clone();
        let parked: i64 = Script::new(DEFER_LUA)
            .key(self.due_key())
            .key(self.parked_key())
            .key(self.lease_key(key))
            .arg(key.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        Ok(parked == 1)
    }

    async fn defer_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        self.move_campaign(campaign_id, self.due_key(), self.parked_key())
            .await
    }

    async fn resume_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        self.move_campaign(campaign_id, self.parked_key(), self.due_key())
            .await
    }

    async fn cancel_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(CANCEL_CAMPAIGN_LUA)
            .key(self.campaign_key(campaign_id))
            .key(self.due_key())
            .key(self.parked_key())
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        Ok(usize::try_from(removed).unwrap_or(0))
    }

    async fn count_by_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        let mut conn = self.conn.clone();
        let count: usize = conn
            .scard(self.campaign_key(campaign_id))
            .await
            .map_err(CampaignError::store)?;
        Ok(count)
    }
}
