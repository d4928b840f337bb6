use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;

/// Kind of conversation a read pointer or counter belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    ClassGroup,
    Channel,
    Private,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown group type: {0}")]
pub struct UnknownGroupType(pub String);

impl GroupType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClassGroup => "class_group",
            Self::Channel => "channel",
            Self::Private => "private",
        }
    }

    /// Maps the legacy numeric room discriminator: 0 is a class group, anything else a channel.
    #[must_use]
    pub const fn from_legacy_discriminator(value: i64) -> Self {
        if value == 0 {
            Self::ClassGroup
        } else {
            Self::Channel
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupType {
    type Err = UnknownGroupType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "classgroup" | "group" => Ok(Self::ClassGroup),
            "channel" => Ok(Self::Channel),
            "private" | "direct" => Ok(Self::Private),
            _ => Err(UnknownGroupType(value.to_string())),
        }
    }
}

/// A persisted chat message as exposed by the durable message store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct ChatMessage {
    pub id: i64,
    /// Room id for group and channel chats, receiver id for private chats.
    pub target_id: i64,
    pub group_type: GroupType,
    pub sender_id: i64,
    pub content_type: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub hidden: bool,
    pub pinned: bool,
    pub edited: bool,
}

/// Durable proof that a user read a message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct ReadReceipt {
    pub message_id: i64,
    pub user_id: i64,
    pub target_id: i64,
    pub group_type: GroupType,
    pub read_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct UnreadCountResponse {
    pub target_id: i64,
    pub group_type: GroupType,
    pub unread: i64,
}

/// Window of messages answered for a chat view, ascending by id.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, ToSchema)]
pub struct ChatWindowResponse {
    pub messages: Vec<ChatMessage>,
    /// Read pointer of the caller at the time the window was computed.
    pub last_read_message_id: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
pub struct ConfirmReadRequest {
    pub message_id: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
pub struct ConfirmReadResponse {
    pub last_read_message_id: i64,
    /// Whether this confirmation moved the read pointer forward.
    pub advanced: bool,
    pub unread: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
pub struct MarkAllReadResponse {
    pub last_read_message_id: i64,
    pub unread: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct SeenByResponse {
    pub message_id: i64,
    pub count: u64,
    pub users: Vec<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
pub struct RecomputeUnreadRequest {
    pub user_id: i64,
    pub target_id: i64,
    pub group_type: GroupType,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
pub struct RecomputeUnreadResponse {
    pub user_id: i64,
    pub target_id: i64,
    pub group_type: GroupType,
    pub unread: i64,
}

/// Outcome of a single reconciliation pass.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, ToSchema)]
pub struct ReconciliationSummary {
    pub keys_scanned: u64,
    pub receipts_inserted: u64,
    pub keys_deleted: u64,
    pub key_errors: u64,
}
