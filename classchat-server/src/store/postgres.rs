use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{AudienceClass, ChatMessage, GroupType, ReadReceipt};
use sqlx::{FromRow, PgPool};
use tracing::instrument;

use super::{ChatScope, MembershipDirectory, MessageStore, ReceiptStore, StoreError, StoreResult};

const MESSAGE_COLUMNS: &str = "id, target_id, group_type, sender_id, content_type, content, \
     sent_at, hidden, pinned, edited";

/// Visible messages of one chat: `$1` group type, `$2` target, `$3` viewer.
const SCOPE_FILTER: &str = "hidden = FALSE AND group_type = $1 AND (\
     ($1 <> 'private' AND target_id = $2) \
     OR ($1 = 'private' AND ((sender_id = $3 AND target_id = $2) \
     OR (sender_id = $2 AND target_id = $3))))";

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    target_id: i64,
    group_type: String,
    sender_id: i64,
    content_type: String,
    content: String,
    sent_at: DateTime<Utc>,
    hidden: bool,
    pinned: bool,
    edited: bool,
}

impl TryFrom<MessageRow> for ChatMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let group_type = row
            .group_type
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("message {} group type", row.id)))?;
        Ok(Self {
            id: row.id,
            target_id: row.target_id,
            group_type,
            sender_id: row.sender_id,
            content_type: row.content_type,
            content: row.content,
            sent_at: row.sent_at,
            hidden: row.hidden,
            pinned: row.pinned,
            edited: row.edited,
        })
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn into_messages(rows: Vec<MessageRow>) -> StoreResult<Vec<ChatMessage>> {
    rows.into_iter().map(ChatMessage::try_from).collect()
}

#[derive(Clone, Debug)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(
        &self,
        scope: ChatScope,
        comparison: &str,
        order: &str,
        cursor: i64,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM classchat.messages \
             WHERE {SCOPE_FILTER} AND id {comparison} $4 ORDER BY id {order} LIMIT $5"
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(scope.group_type.as_str())
            .bind(scope.target_id)
            .bind(scope.viewer)
            .bind(cursor)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await?;
        into_messages(rows)
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    #[instrument(name = "store.messages_before", skip(self), err)]
    async fn before(
        &self,
        scope: ChatScope,
        cursor: i64,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        let mut messages = self.fetch(scope, "<", "DESC", cursor, limit).await?;
        messages.reverse();
        Ok(messages)
    }

    #[instrument(name = "store.messages_after", skip(self), err)]
    async fn after(
        &self,
        scope: ChatScope,
        cursor: i64,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        self.fetch(scope, ">", "ASC", cursor, limit).await
    }

    #[instrument(name = "store.messages_from", skip(self), err)]
    async fn from_inclusive(
        &self,
        scope: ChatScope,
        cursor: i64,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        self.fetch(scope, ">=", "ASC", cursor, limit).await
    }

    #[instrument(name = "store.messages_latest", skip(self), err)]
    async fn latest(&self, scope: ChatScope, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        self.before(scope, i64::MAX, limit).await
    }

    async fn latest_id(&self, scope: ChatScope) -> StoreResult<Option<i64>> {
        let sql = format!("SELECT MAX(id) FROM classchat.messages WHERE {SCOPE_FILTER}");
        let latest: Option<i64> = sqlx::query_scalar(&sql)
            .bind(scope.group_type.as_str())
            .bind(scope.target_id)
            .bind(scope.viewer)
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    async fn contains(&self, scope: ChatScope, message_id: i64) -> StoreResult<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM classchat.messages WHERE {SCOPE_FILTER} AND id = $4)"
        );
        let found: bool = sqlx::query_scalar(&sql)
            .bind(scope.group_type.as_str())
            .bind(scope.target_id)
            .bind(scope.viewer)
            .bind(message_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }

    #[instrument(name = "store.count_unread", skip(self), err)]
    async fn count_unread(
        &self,
        scope: ChatScope,
        after_id: i64,
        through_id: i64,
    ) -> StoreResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM classchat.messages \
             WHERE {SCOPE_FILTER} AND id > $4 AND id <= $5 AND sender_id <> $3"
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(scope.group_type.as_str())
            .bind(scope.target_id)
            .bind(scope.viewer)
            .bind(after_id)
            .bind(through_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[derive(Clone, Debug)]
pub struct PgReceiptStore {
    pool: PgPool,
}

impl PgReceiptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiptStore for PgReceiptStore {
    async fn existing(&self, message_id: i64, users: &[i64]) -> StoreResult<HashSet<i64>> {
        if users.is_empty() {
            return Ok(HashSet::new());
        }
        let found: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM classchat.read_receipts \
             WHERE message_id = $1 AND user_id = ANY($2)",
        )
        .bind(message_id)
        .bind(users.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(found.into_iter().collect())
    }

    #[instrument(name = "store.insert_receipts", skip(self, receipts), fields(count = receipts.len()), err)]
    async fn insert_batch(&self, receipts: &[ReadReceipt]) -> StoreResult<u64> {
        if receipts.is_empty() {
            return Ok(0);
        }

        let message_ids: Vec<i64> = receipts.iter().map(|r| r.message_id).collect();
        let user_ids: Vec<i64> = receipts.iter().map(|r| r.user_id).collect();
        let target_ids: Vec<i64> = receipts.iter().map(|r| r.target_id).collect();
        let group_types: Vec<String> = receipts
            .iter()
            .map(|r| r.group_type.as_str().to_string())
            .collect();
        let read_at: Vec<DateTime<Utc>> = receipts.iter().map(|r| r.read_at).collect();

        let result = sqlx::query(
            "INSERT INTO classchat.read_receipts \
             (message_id, user_id, target_id, group_type, read_at) \
             SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::BIGINT[], $4::TEXT[], $5::TIMESTAMPTZ[]) \
             ON CONFLICT (message_id, user_id) DO NOTHING",
        )
        .bind(message_ids)
        .bind(user_ids)
        .bind(target_ids)
        .bind(group_types)
        .bind(read_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Membership directory backed by the platform's `room_members` and `users` tables.
#[derive(Clone, Debug)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipDirectory for PgDirectory {
    async fn is_member(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
    ) -> StoreResult<bool> {
        let allowed: bool = match group_type {
            GroupType::Private => {
                sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM classchat.users WHERE id = $1) AND $1 <> $2",
                )
                .bind(target_id)
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?
            }
            GroupType::ClassGroup | GroupType::Channel => {
                sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM classchat.room_members \
                     WHERE user_id = $1 AND target_id = $2 AND group_type = $3)",
                )
                .bind(user_id)
                .bind(target_id)
                .bind(group_type.as_str())
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(allowed)
    }

    async fn room_members(&self, target_id: i64, group_type: GroupType) -> StoreResult<Vec<i64>> {
        let members = sqlx::query_scalar(
            "SELECT user_id FROM classchat.room_members \
             WHERE target_id = $1 AND group_type = $2 ORDER BY user_id",
        )
        .bind(target_id)
        .bind(group_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn rooms_for(&self, user_id: i64) -> StoreResult<Vec<(GroupType, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT group_type, target_id FROM classchat.room_members WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(group_type, target_id)| {
                group_type
                    .parse()
                    .map(|group_type| (group_type, target_id))
                    .map_err(|_| StoreError::Corrupt(format!("room {target_id} group type")))
            })
            .collect()
    }

    async fn audience_classes(&self, user_id: i64) -> StoreResult<Vec<AudienceClass>> {
        let role: Option<String> =
            sqlx::query_scalar("SELECT role FROM classchat.users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(classes_for_role(role.as_deref()))
    }
}

/// Every user hears school-wide, pin and receipt broadcasts plus their role's class.
pub(crate) fn classes_for_role(role: Option<&str>) -> Vec<AudienceClass> {
    let mut classes = vec![
        AudienceClass::All,
        AudienceClass::PinWatchers,
        AudienceClass::ReceiptWatchers,
    ];
    match role.map(str::to_ascii_lowercase).as_deref() {
        Some("teacher") => classes.push(AudienceClass::Teachers),
        Some("student") => classes.push(AudienceClass::Students),
        Some("personnel" | "staff" | "admin") => classes.push(AudienceClass::Personnel),
        _ => {}
    }
    classes
}
