//! Per-provider send counters with daily and monthly ceilings.
//!
//! Counters roll over lazily: every operation compares the stored UTC day and
//! month against "now" and zeroes a counter whose period has passed, so no
//! reset job is needed. The check and the increment are a single atomic step.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::Serialize;
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub sent_today: u64,
    pub sent_this_month: u64,
    pub last_daily_reset: Option<NaiveDate>,
    pub last_monthly_reset: Option<NaiveDate>,
}

#[async_trait]
pub trait UsageCounter: Send + Sync {
    /// Count one send if both counters are under their limits.
    /// Returns `false` and changes nothing when either limit is reached.
    async fn try_acquire(
        &self,
        provider_id: Uuid,
        daily_limit: u64,
        monthly_limit: u64,
        now: DateTime<Utc>,
    ) -> CampaignResult<bool>;

    /// Give back one send acquired at `acquired_at`. A counter whose period
    /// has rolled over since then is left alone.
    async fn release(&self, provider_id: Uuid, acquired_at: DateTime<Utc>) -> CampaignResult<()>;

    async fn snapshot(&self, provider_id: Uuid, now: DateTime<Utc>)
        -> CampaignResult<UsageSnapshot>;

    async fn reset(&self, provider_id: Uuid, now: DateTime<Utc>) -> CampaignResult<()>;
}

fn month_start(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

#[derive(Debug, Clone)]
struct Counters {
    day: NaiveDate,
    month: NaiveDate,
    daily: u64,
    monthly: u64,
}

impl Counters {
    fn fresh(now: DateTime<Utc>) -> Self {
        let day = now.date_naive();
        Self {
            day,
            month: month_start(day),
            daily: 0,
            monthly: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        if self.day != day {
            self.day = day;
            self.daily = 0;
        }
        let month = month_start(day);
        if self.month != month {
            self.month = month;
            self.monthly = 0;
        }
    }

    fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            sent_today: self.daily,
            sent_this_month: self.monthly,
            last_daily_reset: Some(self.day),
            last_monthly_reset: Some(self.month),
        }
    }
}

/// Counters held in process. The DashMap entry guard serialises access per
/// provider.
#[derive(Default)]
pub struct MemoryUsageCounter {
    counters: DashMap<Uuid, Counters>,
}

impl MemoryUsageCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageCounter for MemoryUsageCounter {
    async fn try_acquire(
        &self,
        provider_id: Uuid,
        daily_limit: u64,
        monthly_limit: u64,
        now: DateTime<Utc>,
    ) -> CampaignResult<bool> {
        let mut entry = self
            .counters
            .entry(provider_id)
            .or_insert_with(|| Counters::fresh(now));
        entry.roll(now);
        if entry.daily >= daily_limit || entry.monthly >= monthly_limit {
            return Ok(false);
        }
        entry.daily += 1;
        entry.monthly += 1;
        Ok(true)
    }

    async fn release(&self, provider_id: Uuid, acquired_at: DateTime<Utc>) -> CampaignResult<()> {
        let day = acquired_at.date_naive();
        if let Some(mut entry) = self.counters.get_mut(&provider_id) {
            if entry.day == day {
                entry.daily = entry.daily.saturating_sub(1);
            }
            if entry.month == month_start(day) {
                entry.monthly = entry.monthly.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn snapshot(
        &self,
        provider_id: Uuid,
        now: DateTime<Utc>,
    ) -> CampaignResult<UsageSnapshot> {
        Ok(self
            .counters
            .get_mut(&provider_id)
            .map(|mut c| {
                c.roll(now);
                c.snapshot()
            })
            .unwrap_or_default())
    }

    async fn reset(&self, provider_id: Uuid, now: DateTime<Utc>) -> CampaignResult<()> {
        self.counters.insert(provider_id, Counters::fresh(now));
        Ok(())
    }
}

const ACQUIRE_LUA: &str = r#"
local day = redis.call('HGET', KEYS[1], 'day')
local month = redis.call('HGET', KEYS[1], 'month')
local daily = tonumber(redis.call('HGET', KEYS[1], 'daily') or '0')
local monthly = tonumber(redis.call('HGET', KEYS[1], 'monthly') or '0')
if day ~= ARGV[1] then daily = 0 end
if month ~= ARGV[2] then monthly = 0 end
if daily >= tonumber(ARGV[3]) or monthly >= tonumber(ARGV[4]) then
  redis.call('HSET', KEYS[1], 'day', ARGV[1], 'month', ARGV[2], 'daily', daily, 'monthly', monthly)
  return 0
end
redis.call('HSET', KEYS[1], 'day', ARGV[1], 'month', ARGV[2], 'daily', daily + 1, 'monthly', monthly + 1)
return 1
"#;

const RELEASE_LUA: &str = r#"
local daily = tonumber(redis.call('HGET', KEYS[1], 'daily') or '0')
local monthly = tonumber(redis.call('HGET', KEYS[1], 'monthly') or '0')
if redis.call('HGET', KEYS[1], 'day') == ARGV[1] and daily > 0 then
  redis.call('HSET', KEYS[1], 'daily', daily - 1)
end
if redis.call('HGET', KEYS[1], 'month') == ARGV[2] and monthly > 0 then
  redis.call('HSET', KEYS[1], 'monthly', monthly - 1)
end
return 1
"#;

/// Counters in a Redis hash per provider, updated by Lua scripts.
pub struct RedisUsageCounter {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisUsageCounter {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, provider_id: Uuid) -> String {
        format!("{}:usage:{}", self.prefix, provider_id)
    }

    fn periods(now: DateTime<Utc>) -> (String, String) {
        let day = now.date_naive();
        (day.to_string(), month_start(day).to_string())
    }
}

#[async_trait]
impl UsageCounter for RedisUsageCounter {
    async fn try_acquire(
        &self,
        provider_id: Uuid,
        daily_limit: u64,
        monthly_limit: u64,
        now: DateTime<Utc>,
    ) -> CampaignResult<bool> {
        let (day, month) = Self::periods(now);
        let mut conn = self.conn.clone();
        let acquired: i64 = Script::new(ACQUIRE_LUA)
            .key(self.key(provider_id))
            .arg(day)
            .arg(month)
            .arg(daily_limit)
            .arg(monthly_limit)
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        Ok(acquired == 1)
    }

    async fn release(&self, provider_id: Uuid, acquired_at: DateTime<Utc>) -> CampaignResult<()> {
        let (day, month) = Self::periods(acquired_at);
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_LUA)
            .key(self.key(provider_id))
            .arg(day)
            .arg(month)
            .invoke_async(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        Ok(())
    }

    async fn snapshot(
        &self,
        provider_id: Uuid,
        now: DateTime<Utc>,
    ) -> CampaignResult<UsageSnapshot> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.key(provider_id))
            .await
            .map_err(CampaignError::store)?;
        let (day, month) = Self::periods(now);
        let count = |name: &str, period_field: &str, current: &str| -> u64 {
            if fields.get(period_field).map(String::as_str) != Some(current) {
                return 0;
            }
            fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
        };
        Ok(UsageSnapshot {
            sent_today: count("daily", "day", &day),
            sent_this_month: count("monthly", "month", &month),
            last_daily_reset: fields.get("day").and_then(|d| d.parse().ok()),
            last_monthly_reset: fields.get("month").and_then(|d| d.parse().ok()),
        })
    }

    async fn reset(&self, provider_id: Uuid, now: DateTime<Utc>) -> CampaignResult<()> {
        let (day, month) = Self::periods(now);
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(self.key(provider_id))
            .arg("day")
            .arg(day)
            .arg("month")
            .arg(month)
            .arg("daily")
            .arg(0)
            .arg("monthly")
            .arg(0)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(CampaignError::store)?;
        Ok(())
    }
}
