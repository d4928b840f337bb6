use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;

use super::chat::GroupType;

/// Message type carried in the `type` field of an upstream message payload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
pub enum MessageKind {
    Private,
    Group,
    Channel,
    BroadcastToGroups,
    BroadcastToUsers,
    AllTeachers,
    AllStudents,
    AllPersonnel,
    PinUpdate,
    ReadReceipt,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown message kind: {0}")]
pub struct UnknownMessageKind(pub String);

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-' && *c != ' ')
            .collect::<String>()
            .to_ascii_lowercase();

        let kind = match normalized.as_str() {
            "private" => Self::Private,
            "group" | "classgroup" => Self::Group,
            "channel" => Self::Channel,
            "broadcasttogroups" => Self::BroadcastToGroups,
            "broadcasttousers" => Self::BroadcastToUsers,
            "allteachers" => Self::AllTeachers,
            "allstudents" => Self::AllStudents,
            "allpersonnel" => Self::AllPersonnel,
            "pinupdate" | "pinupdated" | "pin" => Self::PinUpdate,
            "readreceipt" | "readconfirmed" | "readconfirmation" => Self::ReadReceipt,
            _ => return Err(UnknownMessageKind(value.to_string())),
        };
        Ok(kind)
    }
}

/// What happened upstream, derived from the invocation method name.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
    PinUpdated,
    ReadConfirmed,
    Other,
}

impl EventAction {
    #[must_use]
    pub fn from_method(method: &str) -> Self {
        match method.to_ascii_lowercase().as_str() {
            "receivemessage" | "newmessage" | "messagecreated" => Self::Created,
            "messageupdated" | "messageedited" => Self::Updated,
            "messagedeleted" => Self::Deleted,
            "pinupdated" => Self::PinUpdated,
            "readconfirmed" | "confirmread" => Self::ReadConfirmed,
            _ => Self::Other,
        }
    }

    /// Only newly created messages move unread counters.
    #[must_use]
    pub const fn counts_as_unread(self) -> bool {
        matches!(self, Self::Created)
    }
}

/// Fixed audiences that are not tied to a single room or user.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AudienceClass {
    All,
    Teachers,
    Students,
    Personnel,
    PinWatchers,
    ReceiptWatchers,
}

impl AudienceClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Teachers => "teachers",
            Self::Students => "students",
            Self::Personnel => "personnel",
            Self::PinWatchers => "pins",
            Self::ReceiptWatchers => "receipts",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "all" => Self::All,
            "teachers" => Self::Teachers,
            "students" => Self::Students,
            "personnel" => Self::Personnel,
            "pins" => Self::PinWatchers,
            "receipts" => Self::ReceiptWatchers,
            _ => return None,
        })
    }
}

/// Addressable downstream delivery channel.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(into = "String", try_from = "String")]
pub enum AudienceKey {
    Private(i64),
    Group(i64),
    Channel(i64),
    Class(AudienceClass),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid audience key: {0}")]
pub struct InvalidAudienceKey(pub String);

impl AudienceKey {
    /// Channel for a room or private inbox identified by `target_id`.
    #[must_use]
    pub const fn for_target(group_type: GroupType, target_id: i64) -> Self {
        match group_type {
            GroupType::ClassGroup => Self::Group(target_id),
            GroupType::Channel => Self::Channel(target_id),
            GroupType::Private => Self::Private(target_id),
        }
    }
}

impl fmt::Display for AudienceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private(user) => write!(f, "private:{user}"),
            Self::Group(id) => write!(f, "group:{id}"),
            Self::Channel(id) => write!(f, "channel:{id}"),
            Self::Class(class) => f.write_str(class.as_str()),
        }
    }
}

impl FromStr for AudienceKey {
    type Err = InvalidAudienceKey;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidAudienceKey(value.to_string());

        if let Some((scope, id)) = value.split_once(':') {
            let id: i64 = id.parse().map_err(|_| invalid())?;
            return match scope {
                "private" => Ok(Self::Private(id)),
                "group" => Ok(Self::Group(id)),
                "channel" => Ok(Self::Channel(id)),
                _ => Err(invalid()),
            };
        }

        AudienceClass::parse(value).map(Self::Class).ok_or_else(invalid)
    }
}

impl From<AudienceKey> for String {
    fn from(key: AudienceKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for AudienceKey {
    type Error = InvalidAudienceKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Upstream event after payload-shape normalization, ready for delivery.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct NormalizedEvent {
    /// Upstream invocation method, e.g. `ReceiveMessage`.
    pub method: String,
    pub action: EventAction,
    pub kind: MessageKind,
    pub message_id: Option<i64>,
    pub sender_id: Option<i64>,
    pub target_id: Option<i64>,
    pub group_type: Option<GroupType>,
    /// For private messages, the participant on the other side relative to the recipient.
    pub other_party_id: Option<i64>,
    #[schema(value_type = Object)]
    pub message: Value,
}
