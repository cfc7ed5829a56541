//! Redis Store
//!
//! Shared backend for several server instances. Records are versioned JSON
//! strings; conditional writes run as Lua scripts so the version check and
//! the write happen in one step on the server. Sorted sets index reset
//! dates, pending expiries, resolution times and usage per account.
//!
//! Key layout (`{p}` is the configured prefix):
//!
//! | key                          | type   | contents                           |
//! |------------------------------|--------|------------------------------------|
//! | `{p}:account:{id}`           | string | account JSON                       |
//! | `{p}:accounts:reset`         | zset   | account id scored by reset date    |
//! | `{p}:reservation:{id}`       | string | reservation JSON                   |
//! | `{p}:reservations:pending`   | zset   | pending id scored by expiry        |
//! | `{p}:reservations:resolved`  | zset   | resolved id scored by resolution   |
//! | `{p}:counter:{key}`          | string | rate-limit counter with TTL        |
//! | `{p}:usage:seq`              | string | usage append sequence              |
//! | `{p}:usage:{account}`        | zset   | entries visible to the account     |
//! | `{p}:reconciliation`         | hash   | parked ledger adjustments by id    |
//! | `{p}:dead_letters`           | hash   | usage dead letters by id           |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

use super::{
    AccountStore, CounterStore, DeadLetterStore, ReconciliationStore, ReservationStore, UsageLog,
};
use crate::account::Account;
use crate::error::StoreError;
use crate::ledger::{ReconciliationItem, Reservation};
use crate::usage::{UsageDeadLetter, UsageLogEntry, UsagePage, UsageQuery};

const INSERT_SCRIPT: &str = r#"
local record_key = KEYS[1]
local index_key = KEYS[2]

if not redis.call("SET", record_key, ARGV[1], "NX") then
  return 0
end
redis.call("ZADD", index_key, ARGV[3], ARGV[2])
return 1
"#;

const SWAP_ACCOUNT_SCRIPT: &str = r#"
local record_key = KEYS[1]
local index_key = KEYS[2]

local current = redis.call("GET", record_key)
if not current then
  return 0
end
local stored = cjson.decode(current)
if tonumber(stored.version or 0) ~= tonumber(ARGV[1]) then
  return 0
end

redis.call("SET", record_key, ARGV[2])
redis.call("ZADD", index_key, ARGV[4], ARGV[3])
return 1
"#;

const SWAP_RESERVATION_SCRIPT: &str = r#"
local record_key = KEYS[1]
local pending_key = KEYS[2]
local resolved_key = KEYS[3]

local current = redis.call("GET", record_key)
if not current then
  return 0
end
local stored = cjson.decode(current)
if tonumber(stored.version or 0) ~= tonumber(ARGV[1]) then
  return 0
end

redis.call("SET", record_key, ARGV[2])
if ARGV[4] == "pending" then
  redis.call("ZREM", resolved_key, ARGV[3])
  redis.call("ZADD", pending_key, ARGV[5], ARGV[3])
else
  redis.call("ZREM", pending_key, ARGV[3])
  redis.call("ZADD", resolved_key, ARGV[5], ARGV[3])
end
return 1
"#;

const INCREMENT_SCRIPT: &str = r#"
local value = redis.call("INCR", KEYS[1])
if value == 1 then
  redis.call("EXPIRE", KEYS[1], ARGV[1])
end
return value
"#;

/// Redis-backed quota store
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
    insert: redis::Script,
    swap_account: redis::Script,
    swap_reservation: redis::Script,
    increment: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url`; every key is namespaced under `prefix`
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            insert: redis::Script::new(INSERT_SCRIPT),
            swap_account: redis::Script::new(SWAP_ACCOUNT_SCRIPT),
            swap_reservation: redis::Script::new(SWAP_RESERVATION_SCRIPT),
            increment: redis::Script::new(INCREMENT_SCRIPT),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key_account(&self, id: &str) -> String {
        format!("{}:account:{id}", self.prefix)
    }

    fn key_account_resets(&self) -> String {
        format!("{}:accounts:reset", self.prefix)
    }

    fn key_reservation(&self, id: &str) -> String {
        format!("{}:reservation:{id}", self.prefix)
    }

    fn key_pending(&self) -> String {
        format!("{}:reservations:pending", self.prefix)
    }

    fn key_resolved(&self) -> String {
        format!("{}:reservations:resolved", self.prefix)
    }

    fn key_counter(&self, key: &str) -> String {
        format!("{}:counter:{key}", self.prefix)
    }

    fn key_usage_seq(&self) -> String {
        format!("{}:usage:seq", self.prefix)
    }

    fn key_usage(&self, account_id: &str) -> String {
        format!("{}:usage:{account_id}", self.prefix)
    }

    fn key_reconciliation(&self) -> String {
        format!("{}:reconciliation", self.prefix)
    }

    fn key_dead_letters(&self) -> String {
        format!("{}:dead_letters", self.prefix)
    }

    /// Every JSON value of a hash
    async fn hash_values<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Vec<T>, StoreError> {
        let mut conn = self.conn.clone();
        let raws: Vec<String> = conn.hvals(key).await?;
        raws.iter()
            .map(|raw| serde_json::from_str(raw).map_err(Into::into))
            .collect()
    }

    /// Fetch JSON records for `keys`, skipping ones deleted meanwhile
    async fn load_many<T: serde::de::DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> Result<Vec<T>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        let raws: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        let mut out = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            out.push(serde_json::from_str(&raw)?);
        }
        Ok(out)
    }
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Zset member for a usage entry; the sequence prefix keeps append order
/// among entries with the same timestamp
fn usage_member(seq: u64, entry: &UsageLogEntry) -> Result<String, StoreError> {
    Ok(format!("{seq:020}:{}", serde_json::to_string(entry)?))
}

fn parse_usage_member(member: &str) -> Result<UsageLogEntry, StoreError> {
    let json = member
        .split_once(':')
        .map(|(_, json)| json)
        .ok_or_else(|| StoreError::Serialization(format!("malformed usage member: {member}")))?;
    Ok(serde_json::from_str(json)?)
}

/// Account whose usage view an entry belongs to
fn usage_owner(entry: &UsageLogEntry) -> &str {
    entry
        .attributed_parent_id
        .as_deref()
        .unwrap_or(&entry.account_id)
}

#[async_trait]
impl AccountStore for RedisStore {
    async fn load_account(&self, id: &str) -> Result<Option<Account>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key_account(id)).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let inserted: i64 = self
            .insert
            .key(self.key_account(&account.id))
            .key(self.key_account_resets())
            .arg(serde_json::to_string(account)?)
            .arg(&account.id)
            .arg(score(account.reset_date))
            .invoke_async(&mut conn)
            .await?;
        if inserted == 0 {
            return Err(StoreError::Conflict(account.id.clone()));
        }
        Ok(())
    }

    async fn swap_account(
        &self,
        account: &Account,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let mut next = account.clone();
        next.version = expected_version + 1;

        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .swap_account
            .key(self.key_account(&account.id))
            .key(self.key_account_resets())
            .arg(expected_version)
            .arg(serde_json::to_string(&next)?)
            .arg(&account.id)
            .arg(score(next.reset_date))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn accounts_due_for_reset(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Account>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(
                self.key_account_resets(),
                "-inf",
                score(now),
                0,
                limit.min(isize::MAX as usize) as isize,
            )
            .await?;
        let keys: Vec<String> = ids.iter().map(|id| self.key_account(id)).collect();
        let accounts: Vec<Account> = self.load_many(&keys).await?;
        Ok(accounts
            .into_iter()
            .filter(|a| a.reset_date <= now)
            .collect())
    }
}

#[async_trait]
impl ReservationStore for RedisStore {
    async fn load_reservation(&self, id: &str) -> Result<Option<Reservation>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key_reservation(id)).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    async fn insert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let inserted: i64 = self
            .insert
            .key(self.key_reservation(&reservation.id))
            .key(self.key_pending())
            .arg(serde_json::to_string(reservation)?)
            .arg(&reservation.id)
            .arg(score(reservation.expires_at))
            .invoke_async(&mut conn)
            .await?;
        if inserted == 0 {
            return Err(StoreError::Conflict(reservation.id.clone()));
        }
        Ok(())
    }

    async fn swap_reservation(
        &self,
        reservation: &Reservation,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let mut next = reservation.clone();
        next.version = expected_version + 1;

        let (state, at) = match next.resolved_at {
            Some(resolved_at) if !next.status.is_pending() => ("resolved", resolved_at),
            _ => ("pending", next.expires_at),
        };

        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .swap_reservation
            .key(self.key_reservation(&reservation.id))
            .key(self.key_pending())
            .key(self.key_resolved())
            .arg(expected_version)
            .arg(serde_json::to_string(&next)?)
            .arg(&reservation.id)
            .arg(state)
            .arg(score(at))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(
                self.key_pending(),
                "-inf",
                score(now),
                0,
                limit.min(isize::MAX as usize) as isize,
            )
            .await?;
        let keys: Vec<String> = ids.iter().map(|id| self.key_reservation(id)).collect();
        let reservations: Vec<Reservation> = self.load_many(&keys).await?;
        Ok(reservations
            .into_iter()
            .filter(|r| r.status.is_pending() && r.is_expired_at(now))
            .collect())
    }

    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let resolved_key = self.key_resolved();
        let ids: Vec<String> = conn
            .zrangebyscore(&resolved_key, "-inf", format!("({}", score(cutoff)))
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.del(self.key_reservation(id)).ignore();
            pipe.zrem(&resolved_key, id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(ids.len())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let value: u64 = self
            .increment
            .key(self.key_counter(key))
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }
}

#[async_trait]
impl UsageLog for RedisStore {
    async fn append(&self, entries: &[UsageLogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let last: u64 = conn
            .incr(self.key_usage_seq(), entries.len() as u64)
            .await?;
        let first = last + 1 - entries.len() as u64;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (offset, entry) in entries.iter().enumerate() {
            let member = usage_member(first + offset as u64, entry)?;
            pipe.zadd(self.key_usage(usage_owner(entry)), member, score(entry.timestamp))
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn query(&self, query: &UsageQuery) -> Result<UsagePage, StoreError> {
        let offset = query.cursor.unwrap_or(0);
        let fetch = query.limit.saturating_add(1).min(isize::MAX as usize) as isize;

        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(
                self.key_usage(&query.account_id),
                score(query.since),
                "+inf",
                offset.min(isize::MAX as u64) as isize,
                fetch,
            )
            .await?;

        let has_more = members.len() > query.limit;
        let entries = members
            .iter()
            .take(query.limit)
            .map(|m| parse_usage_member(m))
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = has_more.then(|| offset + entries.len() as u64);
        Ok(UsagePage {
            entries,
            next_cursor,
        })
    }
}

#[async_trait]
impl ReconciliationStore for RedisStore {
    async fn park_adjustment(&self, item: &ReconciliationItem) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.key_reconciliation(), &item.id, serde_json::to_string(item)?)
            .await?;
        Ok(())
    }

    async fn parked_adjustments(
        &self,
        limit: usize,
    ) -> Result<Vec<ReconciliationItem>, StoreError> {
        let mut items: Vec<ReconciliationItem> =
            self.hash_values(&self.key_reconciliation()).await?;
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn claim_adjustment(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(self.key_reconciliation(), id).await?;
        Ok(removed == 1)
    }
}

#[async_trait]
impl DeadLetterStore for RedisStore {
    async fn park_dead_letter(&self, letter: &UsageDeadLetter) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.key_dead_letters(), &letter.id, serde_json::to_string(letter)?)
            .await?;
        Ok(())
    }

    async fn parked_dead_letters(&self, limit: usize) -> Result<Vec<UsageDeadLetter>, StoreError> {
        let mut letters: Vec<UsageDeadLetter> = self.hash_values(&self.key_dead_letters()).await?;
        letters.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then(a.id.cmp(&b.id)));
        letters.truncate(limit);
        Ok(letters)
    }

    async fn claim_dead_letter(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(self.key_dead_letters(), id).await?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(attributed: Option<&str>) -> UsageLogEntry {
        UsageLogEntry {
            id: "use-1".into(),
            account_id: "sub".into(),
            attributed_parent_id: attributed.map(str::to_string),
            model: "m".into(),
            tokens_consumed: 7,
            endpoint: "/v1/messages".into(),
            request_id: "req:with:colons".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[test]
    fn test_usage_member_keeps_sequence_order() {
        let a = usage_member(9, &entry(None)).unwrap();
        let b = usage_member(10, &entry(None)).unwrap();
        assert!(a < b);
        assert_eq!(parse_usage_member(&b).unwrap(), entry(None));
    }

    #[test]
    fn test_usage_owner() {
        assert_eq!(usage_owner(&entry(None)), "sub");
        assert_eq!(usage_owner(&entry(Some("parent"))), "parent");
    }

    #[test]
    fn test_malformed_member_is_serialization_error() {
        assert!(matches!(
            parse_usage_member("no-separator"),
            Err(StoreError::Serialization(_))
        ));
    }

    /// Needs a reachable server: `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_account_swap_against_server() {
        use crate::account::Tier;

        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let prefix = format!("meterguard-test-{}", uuid::Uuid::new_v4());
        let store = RedisStore::connect(&url, &prefix).await.unwrap();

        let account = Account::new("acct", Tier::Pro, Utc::now());
        store.insert_account(&account).await.unwrap();
        assert!(matches!(
            store.insert_account(&account).await,
            Err(StoreError::Conflict(_))
        ));

        let mut next = store.load_account("acct").await.unwrap().unwrap();
        next.tokens_used = 10;
        assert!(store.swap_account(&next, 0).await.unwrap());
        assert!(!store.swap_account(&next, 0).await.unwrap());
        assert_eq!(store.load_account("acct").await.unwrap().unwrap().version, 1);

        let due = store
            .accounts_due_for_reset(Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }
}
