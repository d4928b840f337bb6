//! Narrow interfaces to the durable tier and the external membership directory.

pub mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use shared::models::{AudienceClass, ChatMessage, GroupType, ReadReceipt};
use thiserror::Error;

pub use postgres::{PgDirectory, PgMessageStore, PgReceiptStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A chat as seen by one viewer.
///
/// For private chats `target_id` is the other participant; for rooms it is the room id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatScope {
    pub target_id: i64,
    pub group_type: GroupType,
    pub viewer: i64,
}

/// Read-only access to persisted messages. Hidden messages are never returned or counted,
/// and every result is ascending by id.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Newest `limit` messages with `id < cursor`.
    async fn before(&self, scope: ChatScope, cursor: i64, limit: usize)
    -> StoreResult<Vec<ChatMessage>>;

    /// Oldest `limit` messages with `id > cursor`.
    async fn after(&self, scope: ChatScope, cursor: i64, limit: usize)
    -> StoreResult<Vec<ChatMessage>>;

    /// Oldest `limit` messages with `id >= cursor`.
    async fn from_inclusive(
        &self,
        scope: ChatScope,
        cursor: i64,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>>;

    async fn latest(&self, scope: ChatScope, limit: usize) -> StoreResult<Vec<ChatMessage>>;

    async fn latest_id(&self, scope: ChatScope) -> StoreResult<Option<i64>>;

    /// Whether `message_id` is a visible message of this chat.
    async fn contains(&self, scope: ChatScope, message_id: i64) -> StoreResult<bool>;

    /// Messages with `after_id < id <= through_id` authored by someone other than the viewer.
    async fn count_unread(&self, scope: ChatScope, after_id: i64, through_id: i64)
    -> StoreResult<i64>;
}

/// Durable read receipts, unique per `(message_id, user_id)`.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Subset of `users` that already hold a receipt for `message_id`.
    async fn existing(&self, message_id: i64, users: &[i64]) -> StoreResult<HashSet<i64>>;

    /// Inserts receipts, treating duplicates as no-ops. Returns the number of new rows.
    async fn insert_batch(&self, receipts: &[ReadReceipt]) -> StoreResult<u64>;
}

/// Membership and audience decisions owned by the external directory.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    async fn is_member(&self, user_id: i64, target_id: i64, group_type: GroupType)
    -> StoreResult<bool>;

    async fn room_members(&self, target_id: i64, group_type: GroupType) -> StoreResult<Vec<i64>>;

    async fn rooms_for(&self, user_id: i64) -> StoreResult<Vec<(GroupType, i64)>>;

    async fn audience_classes(&self, user_id: i64) -> StoreResult<Vec<AudienceClass>>;
}
