//! Campaign definitions and their status, shared by every worker.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::Campaign;

/// Mutation applied atomically to one stored campaign.
pub type CampaignUpdate<'a> = &'a (dyn Fn(&mut Campaign) -> CampaignResult<()> + Send + Sync);

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Insert a new campaign. Fails with `Validation` if the id exists.
    async fn insert(&self, campaign: Campaign) -> CampaignResult<()>;

    async fn get(&self, id: Uuid) -> CampaignResult<Option<Campaign>>;

    async fn list(&self) -> CampaignResult<Vec<Campaign>>;

    /// Apply `update` to the stored campaign with no interleaved writer.
    /// Nothing is written when `update` returns an error.
    async fn update(&self, id: Uuid, update: CampaignUpdate<'_>) -> CampaignResult<Campaign>;
}

#[derive(Default)]
pub struct MemoryCampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn insert(&self, campaign: Campaign) -> CampaignResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.campaigns.entry(campaign.id) {
            Entry::Occupied(_) => Err(CampaignError::Validation(format!(
                "campaign {} already exists",
                campaign.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(campaign);
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> CampaignResult<Option<Campaign>> {
        Ok(self.campaigns.get(&id).map(|c| c.clone()))
    }

    async fn list(&self) -> CampaignResult<Vec<Campaign>> {
        let mut all: Vec<Campaign> = self.campaigns.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    async fn update(&self, id: Uuid, update: CampaignUpdate<'_>) -> CampaignResult<Campaign> {
        let mut stored = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("campaign", id))?;
        let mut next = stored.clone();
        update(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }
}

const INSERT_LUA: &str = r#"
if redis.call('SETNX', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('SADD', KEYS[2], ARGV[2])
return 1
"#;

const CAS_LUA: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

const CAS_ATTEMPTS: usize = 8;

/// Campaigns as JSON strings, updated by compare-and-set on the previous body.
pub struct RedisCampaignStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCampaignStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn campaign_key(&self, id: Uuid) -> String {
        format!("{}:campaign-def:{}", self.prefix, id)
    }

    fn index_key(&self) -> String {
        format!("{}:campaign-defs", self.prefix)
    }

    async fn load(&self, id: Uuid) -> CampaignResult<Option<(String, Campaign)>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .get(self.campaign_key(id))
            .await
            .map_err(CampaignError::store)?;
        match body {
            Some(body) => {
                let campaign = serde_json::from_str(&body)?;
                Ok(Some((body, campaign)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CampaignStore for RedisCampaignStore {
    async fn insert(&self, campaign: Campaign) -> CampaignResult<()> {
        let body = serde_json::to_string(&campaign)?;
        let mut conn = self.conn.clone();
        let inserted: i64 = Script::new(INSERT_LUA)
            .key(self.campaign_key(campaign.id))
            .key(self.index_key())
            .arg(body)
            .arg(campaign.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        if inserted == 1 {
            Ok(())
        } else {
            Err(CampaignError::Validation(format!(
                "campaign {} already exists",
                campaign.id
            )))
        }
    }

    async fn get(&self, id: Uuid) -> CampaignResult<Option<Campaign>> {
        Ok(self.load(id).await?.map(|(_, c)| c))
    }

    async fn list(&self) -> CampaignResult<Vec<Campaign>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.index_key())
            .await
            .map_err(CampaignError::store)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:campaign-def:{}", self.prefix, id))
            .collect();
        let bodies: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        let mut all = bodies
            .into_iter()
            .flatten()
            .map(|b| serde_json::from_str::<Campaign>(&b).map_err(CampaignError::from))
            .collect::<CampaignResult<Vec<_>>>()?;
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    async fn update(&self, id: Uuid, update: CampaignUpdate<'_>) -> CampaignResult<Campaign> {
        for _ in 0..CAS_ATTEMPTS {
            let Some((body, mut next)) = self.load(id).await? else {
                return Err(CampaignError::not_found("campaign", id));
            };
            update(&mut next)?;
            let mut conn = self.conn.clone();
            let swapped: i64 = Script::new(CAS_LUA)
                .key(self.campaign_key(id))
                .arg(body)
                .arg(serde_json::to_string(&next)?)
                .invoke_async(&mut conn)
                .await
                .map_err(CampaignError::store)?;
            if swapped == 1 {
                return Ok(next);
            }
        }
        Err(CampaignError::Store(format!("contended campaign {id}")))
    }
}
