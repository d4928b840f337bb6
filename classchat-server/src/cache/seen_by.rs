use std::{collections::BTreeSet, sync::Arc, time::Duration};

use metrics::counter;
use shared::{config::server::CacheConfig, models::GroupType};
use tracing::{instrument, warn};

use super::{CacheBackend, CacheError, CacheKeys, SeenKey};

/// Ephemeral per-message sets of users that observed the message.
///
/// Sets are append-only from the tracker's side; the reconciliation worker is the only
/// consumer that removes members.
#[derive(Clone)]
pub struct SeenByTracker {
    backend: Arc<dyn CacheBackend>,
    keys: CacheKeys,
    ttl: Duration,
}

impl std::fmt::Debug for SeenByTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeenByTracker")
            .field("keys", &self.keys)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SeenByTracker {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            keys: CacheKeys::new(config.key_prefix.clone()),
            ttl: Duration::from_secs(config.seen_ttl_secs),
        }
    }

    #[instrument(name = "seen.mark", skip(self))]
    pub async fn mark_seen(
        &self,
        user_id: i64,
        message_id: i64,
        target_id: i64,
        group_type: GroupType,
    ) {
        let key = self.keys.seen(message_id, target_id, group_type);
        if let Err(err) = self.backend.set_add(&key, user_id, self.ttl).await {
            counter!("classchat_cache_failures_total", "op" => "mark_seen").increment(1);
            warn!(error = %err, "failed to record seen-by entry");
        }
    }

    /// Users recorded for a message of one chat, as seen from `viewer`.
    ///
    /// Private chats keep one set per reading side, so both sides are read.
    pub async fn seen_users(
        &self,
        viewer: i64,
        message_id: i64,
        target_id: i64,
        group_type: GroupType,
    ) -> BTreeSet<i64> {
        match self
            .collect_users(viewer, message_id, target_id, group_type)
            .await
        {
            Ok(users) => users,
            Err(err) => {
                counter!("classchat_cache_failures_total", "op" => "seen_users").increment(1);
                warn!(message_id, error = %err, "failed to read seen-by set");
                BTreeSet::new()
            }
        }
    }

    pub async fn seen_count(
        &self,
        viewer: i64,
        message_id: i64,
        target_id: i64,
        group_type: GroupType,
    ) -> u64 {
        self.seen_users(viewer, message_id, target_id, group_type)
            .await
            .len() as u64
    }

    async fn collect_users(
        &self,
        viewer: i64,
        message_id: i64,
        target_id: i64,
        group_type: GroupType,
    ) -> Result<BTreeSet<i64>, CacheError> {
        let mut users: BTreeSet<i64> = self
            .backend
            .set_members(&self.keys.seen(message_id, target_id, group_type))
            .await?
            .into_iter()
            .collect();
        if group_type == GroupType::Private && viewer != target_id {
            users.extend(
                self.backend
                    .set_members(&self.keys.seen(message_id, viewer, group_type))
                    .await?,
            );
        }
        Ok(users)
    }

    pub(crate) fn parse_key(&self, key: &str) -> Option<SeenKey> {
        self.keys.parse_seen(key)
    }

    pub(crate) async fn scan_keys(
        &self,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        self.backend
            .scan(cursor, &self.keys.seen_pattern(), count)
            .await
    }

    pub(crate) async fn members(&self, key: &str) -> Result<Vec<i64>, CacheError> {
        self.backend.set_members(key).await
    }

    pub(crate) async fn remove_members(
        &self,
        key: &str,
        members: &[i64],
    ) -> Result<u64, CacheError> {
        self.backend.set_remove(key, members).await
    }

    pub(crate) async fn remaining(&self, key: &str) -> Result<u64, CacheError> {
        self.backend.set_card(key).await
    }

    pub(crate) async fn delete_key(&self, key: &str) -> Result<(), CacheError> {
        self.backend.delete(key).await
    }
}
