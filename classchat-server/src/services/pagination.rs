use std::sync::Arc;

use shared::{
    config::server::PaginationConfig,
    models::{ChatMessage, ChatWindowResponse, GroupType},
};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    cache::ReadStateCache,
    store::{ChatScope, MembershipDirectory, MessageStore, StoreError},
};

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters of one window request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRequest {
    pub target_id: i64,
    pub group_type: GroupType,
    pub user_id: i64,
    pub cursor: Option<i64>,
    pub load_older: bool,
    pub both_directions: bool,
    pub page_size: Option<usize>,
}

#[derive(Clone)]
pub struct PaginationEngine {
    messages: Arc<dyn MessageStore>,
    directory: Arc<dyn MembershipDirectory>,
    cache: ReadStateCache,
    config: PaginationConfig,
}

impl std::fmt::Debug for PaginationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginationEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn merge(mut older: Vec<ChatMessage>, newer: Vec<ChatMessage>) -> Vec<ChatMessage> {
    older.extend(newer);
    older.sort_by_key(|message| message.id);
    older.dedup_by_key(|message| message.id);
    older
}

impl PaginationEngine {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        directory: Arc<dyn MembershipDirectory>,
        cache: ReadStateCache,
        config: PaginationConfig,
    ) -> Self {
        Self {
            messages,
            directory,
            cache,
            config,
        }
    }

    fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size.max(1))
    }

    /// Returns an ascending window of visible messages for the requested position.
    ///
    /// Callers without access receive an empty window rather than an error.
    ///
    /// # Errors
    /// Returns [`PaginationError::Store`] when the durable store cannot be read.
    #[instrument(name = "pagination.get_window", skip(self), err)]
    pub async fn get_window(
        &self,
        request: WindowRequest,
    ) -> Result<ChatWindowResponse, PaginationError> {
        let WindowRequest {
            target_id,
            group_type,
            user_id,
            ..
        } = request;

        if !self
            .directory
            .is_member(user_id, target_id, group_type)
            .await?
        {
            debug!(user_id, target_id, %group_type, "window requested without access");
            return Ok(ChatWindowResponse::default());
        }

        let scope = ChatScope {
            target_id,
            group_type,
            viewer: user_id,
        };
        let last_read = self.cache.get_last_read(user_id, target_id, group_type).await;
        let cursor = request.cursor.filter(|cursor| *cursor > 0);

        let messages = match cursor {
            Some(cursor) if request.both_directions => {
                let older = self
                    .messages
                    .before(scope, cursor, self.config.jump_before)
                    .await?;
                let newer = self
                    .messages
                    .from_inclusive(scope, cursor, self.config.jump_after)
                    .await?;
                merge(older, newer)
            }
            Some(cursor) if request.load_older => {
                self.messages
                    .before(scope, cursor, self.page_size(request.page_size))
                    .await?
            }
            Some(cursor) => {
                self.messages
                    .after(scope, cursor, self.page_size(request.page_size))
                    .await?
            }
            None if last_read > 0 => {
                let older = self
                    .messages
                    .before(scope, last_read, self.config.initial_before)
                    .await?;
                let newer = self
                    .messages
                    .from_inclusive(scope, last_read, self.config.initial_after)
                    .await?;
                merge(older, newer)
            }
            None => self.messages.latest(scope, self.config.latest_limit).await?,
        };

        Ok(ChatWindowResponse {
            messages,
            last_read_message_id: last_read,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{MemoryMessages, StaticDirectory, memory_read_state, message};
    use shared::config::server::{Config, Profile};

    fn engine(messages: MemoryMessages, cache: ReadStateCache) -> PaginationEngine {
        let directory = StaticDirectory::default().with_room(GroupType::ClassGroup, 7, &[100]);
        PaginationEngine::new(
            Arc::new(messages),
            Arc::new(directory),
            cache,
            Config::default_for_profile(Profile::Test).pagination,
        )
    }

    fn group_history(ids: std::ops::RangeInclusive<i64>) -> MemoryMessages {
        MemoryMessages::new(ids.map(|id| message(id, 7, GroupType::ClassGroup, 200)).collect())
    }

    fn request(cursor: Option<i64>, load_older: bool, both_directions: bool) -> WindowRequest {
        WindowRequest {
            target_id: 7,
            group_type: GroupType::ClassGroup,
            user_id: 100,
            cursor,
            load_older,
            both_directions,
            page_size: None,
        }
    }

    fn ids(window: &ChatWindowResponse) -> Vec<i64> {
        window.messages.iter().map(|message| message.id).collect()
    }

    #[tokio::test]
    async fn jump_window_is_contiguous_around_the_cursor() {
        let engine = engine(group_history(1..=100), memory_read_state());
        let window = engine.get_window(request(Some(50), false, true)).await.unwrap();

        assert_eq!(ids(&window), (25..=69).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn older_and_newer_pages_exclude_the_cursor() {
        let engine = engine(group_history(1..=100), memory_read_state());

        let older = engine.get_window(request(Some(60), true, false)).await.unwrap();
        assert_eq!(ids(&older), (10..=59).collect::<Vec<_>>());

        let newer = engine.get_window(request(Some(60), false, false)).await.unwrap();
        assert_eq!(ids(&newer), (61..=100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn page_size_is_clamped() {
        let engine = engine(group_history(1..=300), memory_read_state());
        let mut huge = request(Some(300), true, false);
        huge.page_size = Some(10_000);
        assert_eq!(engine.get_window(huge).await.unwrap().messages.len(), 100);

        let mut zero = request(Some(300), true, false);
        zero.page_size = Some(0);
        assert_eq!(ids(&engine.get_window(zero).await.unwrap()), vec![299]);
    }

    #[tokio::test]
    async fn initial_load_centres_on_the_read_pointer() {
        let cache = memory_read_state();
        cache.set_last_read(100, 7, GroupType::ClassGroup, 53).await;
        let engine = engine(group_history(51..=55), cache);

        let window = engine.get_window(request(None, false, false)).await.unwrap();
        assert_eq!(window.last_read_message_id, 53);
        assert_eq!(ids(&window), vec![51, 52, 53, 54, 55]);
    }

    #[tokio::test]
    async fn initial_load_without_pointer_returns_latest() {
        let engine = engine(group_history(1..=80), memory_read_state());
        let window = engine.get_window(request(Some(0), true, true)).await.unwrap();
        assert_eq!(ids(&window), (31..=80).collect::<Vec<_>>());
        assert_eq!(window.last_read_message_id, 0);
    }

    #[tokio::test]
    async fn hidden_messages_are_skipped() {
        let mut history: Vec<_> = (1..=5)
            .map(|id| message(id, 7, GroupType::ClassGroup, 200))
            .collect();
        history[2].hidden = true;
        let engine = engine(MemoryMessages::new(history), memory_read_state());

        let window = engine.get_window(request(None, false, false)).await.unwrap();
        assert_eq!(ids(&window), vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn non_members_get_an_empty_window() {
        let engine = engine(group_history(1..=10), memory_read_state());
        let mut outsider = request(None, false, false);
        outsider.user_id = 999;

        let window = engine.get_window(outsider).await.unwrap();
        assert!(window.messages.is_empty());
    }
}
