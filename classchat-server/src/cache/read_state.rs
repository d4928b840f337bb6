use std::{sync::Arc, time::Duration};

use metrics::counter;
use shared::{config::server::CacheConfig, models::GroupType};
use tracing::{instrument, warn};

use super::{CacheBackend, CacheError, CacheKeys};

/// Unread counters and last-read pointers.
///
/// Every operation is best-effort: a cache failure is logged, counted and degraded to a
/// neutral result (0 or no-op) so sends and reads are never blocked by the cache tier.
#[derive(Clone)]
pub struct ReadStateCache {
    backend: Arc<dyn CacheBackend>,
    keys: CacheKeys,
    ttl: Duration,
}

impl std::fmt::Debug for ReadStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStateCache")
            .field("keys", &self.keys)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn degrade(op: &'static str, err: &CacheError) {
    counter!("classchat_cache_failures_total", "op" => op).increment(1);
    warn!(op, error = %err, "read-state cache operation failed; degrading");
}

impl ReadStateCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            keys: CacheKeys::new(config.key_prefix.clone()),
            ttl: Duration::from_secs(config.read_state_ttl_secs),
        }
    }

    #[instrument(name = "cache.increment_unread", skip(self))]
    pub async fn increment_unread(&self, user_id: i64, target_id: i64, group_type: GroupType) {
        let key = self.keys.unread(user_id, target_id, group_type);
        if let Err(err) = self.backend.incr_with_ttl(&key, self.ttl).await {
            degrade("increment_unread", &err);
        }
    }

    pub async fn decrement_unread(&self, user_id: i64, target_id: i64, group_type: GroupType) {
        self.decrement_unread_by(user_id, target_id, group_type, 1).await;
    }

    /// Subtracts `count` read messages; reaching 0 deletes the key.
    #[instrument(name = "cache.decrement_unread", skip(self))]
    pub async fn decrement_unread_by(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
        count: i64,
    ) {
        if count <= 0 {
            return;
        }
        let key = self.keys.unread(user_id, target_id, group_type);
        if let Err(err) = self.backend.decr_or_delete(&key, count).await {
            degrade("decrement_unread", &err);
        }
    }

    #[instrument(name = "cache.reset_unread", skip(self))]
    pub async fn reset_unread(&self, user_id: i64, target_id: i64, group_type: GroupType) {
        let key = self.keys.unread(user_id, target_id, group_type);
        if let Err(err) = self.backend.delete(&key).await {
            degrade("reset_unread", &err);
        }
    }

    /// Overwrites the counter with a recomputed value; 0 deletes the key.
    #[instrument(name = "cache.set_unread", skip(self))]
    pub async fn set_unread(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
        count: i64,
    ) -> Result<(), CacheError> {
        let key = self.keys.unread(user_id, target_id, group_type);
        self.backend.set_counter(&key, count, self.ttl).await
    }

    pub async fn get_unread(&self, user_id: i64, target_id: i64, group_type: GroupType) -> i64 {
        let key = self.keys.unread(user_id, target_id, group_type);
        match self.backend.get_i64(&key).await {
            Ok(value) => value.unwrap_or(0).max(0),
            Err(err) => {
                degrade("get_unread", &err);
                0
            }
        }
    }

    /// Moves the read pointer forward; stale or repeated ids are no-ops.
    /// Returns whether the pointer advanced.
    pub async fn set_last_read(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
        message_id: i64,
    ) -> bool {
        self.advance_last_read(user_id, target_id, group_type, message_id)
            .await
            .is_some()
    }

    /// Like [`Self::set_last_read`], returning the pointer it replaced (0 when unset).
    #[instrument(name = "cache.set_last_read", skip(self))]
    pub async fn advance_last_read(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
        message_id: i64,
    ) -> Option<i64> {
        let key = self.keys.last_read(user_id, target_id, group_type);
        match self.backend.set_if_greater(&key, message_id, self.ttl).await {
            Ok(previous) => previous,
            Err(err) => {
                degrade("set_last_read", &err);
                None
            }
        }
    }

    pub async fn get_last_read(&self, user_id: i64, target_id: i64, group_type: GroupType) -> i64 {
        let key = self.keys.last_read(user_id, target_id, group_type);
        match self.backend.get_i64(&key).await {
            Ok(value) => value.unwrap_or(0),
            Err(err) => {
                degrade("get_last_read", &err);
                0
            }
        }
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }
}
