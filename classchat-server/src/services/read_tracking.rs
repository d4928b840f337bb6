use std::sync::Arc;

use serde_json::json;
use shared::models::{
    ConfirmReadResponse, GroupType, MarkAllReadResponse, RecomputeUnreadResponse, SeenByResponse,
};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{
    bridge::{HubError, HubHandle},
    cache::{CacheError, ReadStateCache, SeenByTracker},
    store::{ChatScope, MembershipDirectory, MessageStore, StoreError},
};

#[derive(Debug, Error)]
pub enum ReadTrackingError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type ReadTrackingResult<T> = Result<T, ReadTrackingError>;

/// Entry points that move read state: confirmations, mark-all-read and recomputation.
#[derive(Clone)]
pub struct ReadTracker {
    cache: ReadStateCache,
    seen: SeenByTracker,
    messages: Arc<dyn MessageStore>,
    directory: Arc<dyn MembershipDirectory>,
    hub: Option<HubHandle>,
}

impl std::fmt::Debug for ReadTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTracker")
            .field("hub", &self.hub.as_ref().map(HubHandle::state))
            .finish_non_exhaustive()
    }
}

impl ReadTracker {
    pub fn new(
        cache: ReadStateCache,
        seen: SeenByTracker,
        messages: Arc<dyn MessageStore>,
        directory: Arc<dyn MembershipDirectory>,
        hub: Option<HubHandle>,
    ) -> Self {
        Self {
            cache,
            seen,
            messages,
            directory,
            hub,
        }
    }

    async fn ensure_member(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
    ) -> ReadTrackingResult<()> {
        if self
            .directory
            .is_member(user_id, target_id, group_type)
            .await?
        {
            Ok(())
        } else {
            Err(ReadTrackingError::Forbidden(format!(
                "user {user_id} has no access to {group_type} {target_id}"
            )))
        }
    }

    fn forward_upstream(&self, user_id: i64, target_id: i64, group_type: GroupType, message_id: i64) {
        let Some(hub) = &self.hub else {
            return;
        };
        let arguments = json!({
            "userId": user_id,
            "messageId": message_id,
            "targetId": target_id,
            "groupType": group_type,
        });
        match hub.send("ConfirmRead", arguments) {
            Ok(()) => {}
            Err(HubError::NotConnected) => {
                debug!(message_id, "hub not connected; read confirmation not forwarded");
            }
            Err(err) => warn!(message_id, error = %err, "failed to forward read confirmation"),
        }
    }

    /// Records that `user_id` read `message_id` in the given chat.
    ///
    /// The counter drops by the unread messages the pointer moved over.
    ///
    /// # Errors
    /// `Validation` for ids that are not visible messages of the chat, `Forbidden` when the
    /// user is not in the chat and `Store` when a lookup fails. Cache failures never surface.
    #[instrument(name = "read.confirm", skip(self), err)]
    pub async fn confirm_read(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
        message_id: i64,
    ) -> ReadTrackingResult<ConfirmReadResponse> {
        if message_id <= 0 {
            return Err(ReadTrackingError::Validation(
                "message_id must be positive".into(),
            ));
        }
        self.ensure_member(user_id, target_id, group_type).await?;

        let scope = ChatScope {
            target_id,
            group_type,
            viewer: user_id,
        };
        if !self.messages.contains(scope, message_id).await? {
            return Err(ReadTrackingError::Validation(format!(
                "message {message_id} does not belong to {group_type} {target_id}"
            )));
        }

        self.seen
            .mark_seen(user_id, message_id, target_id, group_type)
            .await;
        let previous = self
            .cache
            .advance_last_read(user_id, target_id, group_type, message_id)
            .await;
        let advanced = previous.is_some();
        if let Some(previous) = previous {
            let covered = match self.messages.count_unread(scope, previous, message_id).await {
                Ok(covered) => covered,
                Err(err) => {
                    warn!(message_id, error = %err, "could not count covered messages");
                    1
                }
            };
            self.cache
                .decrement_unread_by(user_id, target_id, group_type, covered)
                .await;
        }

        let last_read = self.cache.get_last_read(user_id, target_id, group_type).await;
        let unread = self.cache.get_unread(user_id, target_id, group_type).await;
        self.forward_upstream(user_id, target_id, group_type, message_id);

        Ok(ConfirmReadResponse {
            last_read_message_id: last_read,
            advanced,
            unread,
        })
    }

    /// Clears the unread counter and moves the pointer to the newest visible message.
    ///
    /// # Errors
    /// `Forbidden` when the user is not in the chat and `Store` when the store is unreachable.
    #[instrument(name = "read.mark_all", skip(self), err)]
    pub async fn mark_all_read(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
    ) -> ReadTrackingResult<MarkAllReadResponse> {
        self.ensure_member(user_id, target_id, group_type).await?;

        let scope = ChatScope {
            target_id,
            group_type,
            viewer: user_id,
        };
        self.cache.reset_unread(user_id, target_id, group_type).await;
        if let Some(latest) = self.messages.latest_id(scope).await? {
            self.cache
                .set_last_read(user_id, target_id, group_type, latest)
                .await;
        }

        Ok(MarkAllReadResponse {
            last_read_message_id: self.cache.get_last_read(user_id, target_id, group_type).await,
            unread: 0,
        })
    }

    pub async fn unread(&self, user_id: i64, target_id: i64, group_type: GroupType) -> i64 {
        self.cache.get_unread(user_id, target_id, group_type).await
    }

    /// Users that saw `message_id` in a chat the caller belongs to.
    ///
    /// # Errors
    /// `Forbidden` when the caller is not in the chat and `Store` when the lookup fails.
    pub async fn seen_by(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
        message_id: i64,
    ) -> ReadTrackingResult<SeenByResponse> {
        self.ensure_member(user_id, target_id, group_type).await?;
        let users = self
            .seen
            .seen_users(user_id, message_id, target_id, group_type)
            .await;
        Ok(SeenByResponse {
            message_id,
            count: users.len() as u64,
            users: users.into_iter().collect(),
        })
    }

    /// Rebuilds the unread counter from the durable store.
    ///
    /// # Errors
    /// `Store` when the count cannot be read, `Cache` when the new value cannot be written.
    #[instrument(name = "read.recompute", skip(self), err)]
    pub async fn recompute_unread(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
    ) -> ReadTrackingResult<RecomputeUnreadResponse> {
        let scope = ChatScope {
            target_id,
            group_type,
            viewer: user_id,
        };
        let pointer = self.cache.get_last_read(user_id, target_id, group_type).await;
        let unread = self.messages.count_unread(scope, pointer, i64::MAX).await?;
        self.cache
            .set_unread(user_id, target_id, group_type, unread)
            .await?;

        Ok(RecomputeUnreadResponse {
            user_id,
            target_id,
            group_type,
            unread,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{MemoryMessages, StaticDirectory, memory_backend, message};
    use shared::config::server::{Config, Profile};

    struct Harness {
        tracker: ReadTracker,
        cache: ReadStateCache,
    }

    fn harness(history: MemoryMessages) -> Harness {
        let config = Config::default_for_profile(Profile::Test);
        let backend = memory_backend();
        let cache = ReadStateCache::new(Arc::clone(&backend), &config.cache);
        let seen = SeenByTracker::new(backend, &config.cache);
        let directory = StaticDirectory::default()
            .with_room(GroupType::ClassGroup, 7, &[100, 101, 200])
            .with_private(100, 5);
        let tracker = ReadTracker::new(
            cache.clone(),
            seen,
            Arc::new(history),
            Arc::new(directory),
            None,
        );
        Harness { tracker, cache }
    }

    fn group_history() -> MemoryMessages {
        MemoryMessages::new(
            (51..=55)
                .map(|id| message(id, 7, GroupType::ClassGroup, 200))
                .collect(),
        )
    }

    #[tokio::test]
    async fn pointer_survives_a_stale_confirmation() {
        let Harness { tracker, cache } = harness(group_history());
        for _ in 0..5 {
            cache.increment_unread(100, 7, GroupType::ClassGroup).await;
        }

        let first = tracker
            .confirm_read(100, 7, GroupType::ClassGroup, 53)
            .await
            .unwrap();
        assert!(first.advanced);
        assert_eq!(first.last_read_message_id, 53);
        // 54 and 55 are still unread.
        assert_eq!(first.unread, 2);

        let stale = tracker
            .confirm_read(100, 7, GroupType::ClassGroup, 51)
            .await
            .unwrap();
        assert!(!stale.advanced);
        assert_eq!(stale.last_read_message_id, 53);
        assert_eq!(stale.unread, 2);
    }

    #[tokio::test]
    async fn skipping_ahead_counts_every_covered_message() {
        let Harness { tracker, cache } = harness(group_history());
        cache.set_last_read(100, 7, GroupType::ClassGroup, 50).await;
        for _ in 0..5 {
            cache.increment_unread(100, 7, GroupType::ClassGroup).await;
        }

        let response = tracker
            .confirm_read(100, 7, GroupType::ClassGroup, 53)
            .await
            .unwrap();
        assert_eq!(response.unread, 2);

        let response = tracker
            .confirm_read(100, 7, GroupType::ClassGroup, 55)
            .await
            .unwrap();
        assert_eq!(response.unread, 0);
    }

    #[tokio::test]
    async fn confirming_an_unknown_message_leaves_the_pointer_alone() {
        let Harness { tracker, cache } = harness(group_history());

        assert!(matches!(
            tracker
                .confirm_read(100, 7, GroupType::ClassGroup, 1_000_000_000)
                .await,
            Err(ReadTrackingError::Validation(_))
        ));
        assert_eq!(cache.get_last_read(100, 7, GroupType::ClassGroup).await, 0);

        let response = tracker
            .confirm_read(100, 7, GroupType::ClassGroup, 54)
            .await
            .unwrap();
        assert!(response.advanced);
        assert_eq!(response.last_read_message_id, 54);
        assert_eq!(
            tracker
                .seen_by(100, 7, GroupType::ClassGroup, 1_000_000_000)
                .await
                .unwrap()
                .count,
            0
        );
    }

    #[tokio::test]
    async fn messages_of_another_chat_are_rejected() {
        let mut history: Vec<_> = (51..=55)
            .map(|id| message(id, 7, GroupType::ClassGroup, 200))
            .collect();
        history.push(message(70, 8, GroupType::ClassGroup, 200));
        let Harness { tracker, .. } = harness(MemoryMessages::new(history));

        assert!(matches!(
            tracker.confirm_read(100, 7, GroupType::ClassGroup, 70).await,
            Err(ReadTrackingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn confirmations_feed_seen_by() {
        let Harness { tracker, .. } = harness(group_history());
        tracker.confirm_read(100, 7, GroupType::ClassGroup, 54).await.unwrap();
        tracker.confirm_read(101, 7, GroupType::ClassGroup, 54).await.unwrap();
        tracker.confirm_read(101, 7, GroupType::ClassGroup, 54).await.unwrap();

        let seen = tracker
            .seen_by(200, 7, GroupType::ClassGroup, 54)
            .await
            .unwrap();
        assert_eq!(seen.count, 2);
        assert_eq!(seen.users, vec![100, 101]);
    }

    #[tokio::test]
    async fn seen_by_is_limited_to_members() {
        let Harness { tracker, .. } = harness(group_history());
        tracker.confirm_read(100, 7, GroupType::ClassGroup, 54).await.unwrap();

        assert!(matches!(
            tracker.seen_by(999, 7, GroupType::ClassGroup, 54).await,
            Err(ReadTrackingError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn outsiders_and_bad_ids_are_rejected() {
        let Harness { tracker, .. } = harness(group_history());
        assert!(matches!(
            tracker.confirm_read(999, 7, GroupType::ClassGroup, 53).await,
            Err(ReadTrackingError::Forbidden(_))
        ));
        assert!(matches!(
            tracker.confirm_read(100, 7, GroupType::ClassGroup, 0).await,
            Err(ReadTrackingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn mark_all_read_jumps_to_latest() {
        let Harness { tracker, cache } = harness(group_history());
        cache.increment_unread(100, 7, GroupType::ClassGroup).await;

        let response = tracker
            .mark_all_read(100, 7, GroupType::ClassGroup)
            .await
            .unwrap();
        assert_eq!(response.last_read_message_id, 55);
        assert_eq!(cache.get_unread(100, 7, GroupType::ClassGroup).await, 0);
    }

    #[tokio::test]
    async fn recompute_matches_the_durable_store() {
        let mut history: Vec<_> = (51..=55)
            .map(|id| message(id, 7, GroupType::ClassGroup, 200))
            .collect();
        history[3].sender_id = 100;
        history[4].hidden = true;
        let Harness { tracker, cache } = harness(MemoryMessages::new(history));
        cache.set_last_read(100, 7, GroupType::ClassGroup, 51).await;
        for _ in 0..9 {
            cache.increment_unread(100, 7, GroupType::ClassGroup).await;
        }

        let response = tracker
            .recompute_unread(100, 7, GroupType::ClassGroup)
            .await
            .unwrap();
        // 52 and 53 remain: 54 is the viewer's own and 55 is hidden.
        assert_eq!(response.unread, 2);
        assert_eq!(cache.get_unread(100, 7, GroupType::ClassGroup).await, 2);
    }

    #[tokio::test]
    async fn private_confirmation_without_hub_still_succeeds() {
        let history = MemoryMessages::new(vec![message(60, 100, GroupType::Private, 5)]);
        let Harness { tracker, cache } = harness(history);
        cache.increment_unread(100, 5, GroupType::Private).await;

        let response = tracker
            .confirm_read(100, 5, GroupType::Private, 60)
            .await
            .unwrap();
        assert_eq!(response.unread, 0);
    }
}
