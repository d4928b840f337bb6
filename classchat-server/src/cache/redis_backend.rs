use std::{future::Future, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};

use super::{CacheBackend, CacheError};

const SET_IF_GREATER: &str = r"
local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
local new = tonumber(ARGV[1])
if new > cur then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
  return cur
end
return -1
";

const DECR_OR_DELETE: &str = r"
local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
local by = tonumber(ARGV[1])
if cur <= by then
  redis.call('DEL', KEYS[1])
  return 0
end
return redis.call('DECRBY', KEYS[1], by)
";

/// Redis-backed cache; every round-trip is bounded by the configured operation timeout.
#[derive(Clone)]
pub struct RedisBackend {
    manager: ConnectionManager,
    op_timeout: Duration,
    set_if_greater: Script,
    decr_or_delete: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            op_timeout,
            set_if_greater: Script::new(SET_IF_GREATER),
            decr_or_delete: Script::new(DECR_OR_DELETE),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(op)),
        }
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.conn();
        let (value,): (i64,) = self
            .bounded(
                "incr",
                redis::pipe()
                    .atomic()
                    .incr(key, 1)
                    .expire(key, ttl_secs(ttl))
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(value)
    }

    async fn decr_or_delete(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        let mut conn = self.conn();
        self.bounded(
            "decr",
            self.decr_or_delete.key(key).arg(by).invoke_async(&mut conn),
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: i64 = self.bounded("del", conn.del(key)).await?;
        Ok(())
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn();
        self.bounded("get", conn.get(key)).await
    }

    async fn set_if_greater(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn();
        let previous: i64 = self
            .bounded(
                "set_if_greater",
                self.set_if_greater
                    .key(key)
                    .arg(value)
                    .arg(ttl_secs(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok((previous >= 0).then_some(previous))
    }

    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn();
        if value <= 0 {
            let _: i64 = self.bounded("del", conn.del(key)).await?;
        } else {
            let _: () = self
                .bounded(
                    "set",
                    conn.set_ex(key, value, ttl.as_secs().max(1)),
                )
                .await?;
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: i64, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        let (added,): (i64,) = self
            .bounded(
                "sadd",
                redis::pipe()
                    .atomic()
                    .sadd(key, member)
                    .expire(key, ttl_secs(ttl))
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(added == 1)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<i64>, CacheError> {
        let mut conn = self.conn();
        self.bounded("smembers", conn.smembers(key)).await
    }

    async fn set_card(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn();
        self.bounded("scard", conn.scard(key)).await
    }

    async fn set_remove(&self, key: &str, members: &[i64]) -> Result<u64, CacheError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        self.bounded("srem", conn.srem(key, members)).await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let mut conn = self.conn();
        self.bounded(
            "scan",
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count.max(1))
                .query_async(&mut conn),
        )
        .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: String = self
            .bounded("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}
