//! Redis ledger. Rows are JSON strings updated by compare-and-set on the
//! exact previous body, so concurrent webhook and worker writes never
//! overwrite each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::warn;
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::{DeliveryStatus, DispatchRecord, LedgerEntry, TaskKey};

use crate::store::{
    apply_escalation, apply_finish, BeginOutcome, EscalationOutcome, FinishOutcome, LedgerStore,
};

const BEGIN_LUA: &str = r#"
if redis.call('SETNX', KEYS[1], ARGV[1]) == 1 then
  redis.call('SADD', KEYS[2], ARGV[2])
  return false
end
return redis.call('GET', KEYS[1])
"#;

const CAS_LUA: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
if ARGV[3] ~= '' then
  redis.call('SET', KEYS[2], ARGV[3])
end
if ARGV[4] ~= '' then
  redis.call('SADD', KEYS[3], ARGV[4])
end
return 1
"#;

/// Attempts before a contended compare-and-set gives up.
const CAS_ATTEMPTS: usize = 8;

pub struct RedisLedger {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisLedger {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn row_key(&self, key: &TaskKey) -> String {
        format!("{}:ledger:{}", self.prefix, key)
    }

    fn external_key(&self, external_id: &str) -> String {
        format!("{}:ledger:ext:{}", self.prefix, external_id)
    }

    fn campaign_key(&self, campaign_id: Uuid) -> String {
        format!("{}:ledger:campaign:{}", self.prefix, campaign_id)
    }

    fn engaged_key(&self, campaign_id: Uuid) -> String {
        format!("{}:ledger:engaged:{}", self.prefix, campaign_id)
    }

    async fn load(&self, key: &TaskKey) -> CampaignResult<Option<(String, LedgerEntry)>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .get(self.row_key(key))
            .await
            .map_err(CampaignError::store)?;
        match body {
            Some(body) => {
                let entry = serde_json::from_str(&body)?;
                Ok(Some((body, entry)))
            }
            None => Ok(None),
        }
    }

    async fn compare_and_set(
        &self,
        previous: &str,
        next: &LedgerEntry,
        index_external: bool,
        mark_engaged: bool,
    ) -> CampaignResult<bool> {
        let body = serde_json::to_string(next)?;
        let external_id = next.external_id.as_deref().filter(|_| index_external);
        let mut conn = self.conn.clone();
        let swapped: i64 = Script::new(CAS_LUA)
            .key(self.row_key(&next.task_key))
            .key(self.external_key(external_id.unwrap_or("")))
            .key(self.engaged_key(next.campaign_id))
            .arg(previous)
            .arg(body)
            .arg(external_id.map(|_| next.task_key.as_str()).unwrap_or(""))
            .arg(if mark_engaged {
                next.recipient_id.to_string()
            } else {
                String::new()
            })
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        Ok(swapped == 1)
    }
}

#[async_trait]
impl LedgerStore for RedisLedger {
    async fn begin(&self, entry: LedgerEntry) -> CampaignResult<BeginOutcome> {
        let body = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();
        let existing: Option<String> = Script::new(BEGIN_LUA)
            .key(self.row_key(&entry.task_key))
            .key(self.campaign_key(entry.campaign_id))
            .arg(body)
            .arg(entry.task_key.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        match existing {
            None => Ok(BeginOutcome::Inserted),
            Some(body) => Ok(BeginOutcome::Existing(serde_json::from_str(&body)?)),
        }
    }

    async fn get(&self, key: &TaskKey) -> CampaignResult<Option<LedgerEntry>> {
        Ok(self.load(key).await?.map(|(_, entry)| entry))
    }

    async fn finish(
        &self,
        key: &TaskKey,
        record: DispatchRecord,
        now: DateTime<Utc>,
    ) -> CampaignResult<FinishOutcome> {
        for _ in 0..CAS_ATTEMPTS {
            let Some((body, entry)) = self.load(key).await? else {
                return Ok(FinishOutcome::Missing);
            };
            let Some(next) = apply_finish(&entry, &record, now) else {
                return Ok(FinishOutcome::AlreadyFinished(entry));
            };
            if self.compare_and_set(&body, &next, true, false).await? {
                return Ok(FinishOutcome::Finished(next));
            }
        }
        warn!(task_key = %key, "Ledger finish lost every compare-and-set race");
        Err(CampaignError::Store(format!("contended ledger row {key}")))
    }

    async fn find_by_external_id(&self, external_id: &str) -> CampaignResult<Option<LedgerEntry>> {
        let mut conn = self.conn.clone();
        let key: Option<String> = conn
            .get(self.external_key(external_id))
            .await
            .map_err(CampaignError::store)?;
        match key {
            Some(key) => self.get(&TaskKey::from_raw(key)).await,
            None => Ok(None),
        }
    }

    async fn escalate(
        &self,
        key: &TaskKey,
        status: DeliveryStatus,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> CampaignResult<EscalationOutcome> {
        for _ in 0..CAS_ATTEMPTS {
            let Some((body, entry)) = self.load(key).await? else {
                return Ok(EscalationOutcome::Missing);
            };
            let next = match apply_escalation(&entry, status, detail.clone(), now) {
                Ok(next) => next,
                Err(current) => return Ok(EscalationOutcome::Ignored { current }),
            };
            if self
                .compare_and_set(&body, &next, false, next.status.is_engagement())
                .await?
            {
                return Ok(EscalationOutcome::Applied {
                    from: entry.status,
                    entry: next,
                });
            }
        }
        warn!(task_key = %key, "Ledger escalation lost every compare-and-set race");
        Err(CampaignError::Store(format!("contended ledger row {key}")))
    }

    async fn has_engagement(&self, campaign_id: Uuid, recipient_id: Uuid) -> CampaignResult<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(self.engaged_key(campaign_id), recipient_id.to_string())
            .await
            .map_err(CampaignError::store)
    }

    async fn list_by_campaign(&self, campaign_id: Uuid) -> CampaignResult<Vec<LedgerEntry>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .smembers(self.campaign_key(campaign_id))
            .await
            .map_err(CampaignError::store)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let row_keys: Vec<String> = keys
            .iter()
            .map(|k| self.row_key(&TaskKey::from_raw(k.as_str())))
            .collect();
        let bodies: Vec<Option<String>> = redis::cmd("MGET")
            .arg(row_keys)
            .query_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        let mut rows = bodies
            .into_iter()
            .flatten()
            .map(|b| serde_json::from_str::<LedgerEntry>(&b).map_err(CampaignError::from))
            .collect::<CampaignResult<Vec<_>>>()?;
        rows.sort_by(|a, b| {
            a.attempt_started_at
                .cmp(&b.attempt_started_at)
                .then_with(|| a.task_key.cmp(&b.task_key))
        });
        Ok(rows)
    }
}
