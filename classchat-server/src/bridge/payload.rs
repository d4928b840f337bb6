use serde_json::{Map, Value};
use shared::models::{EventAction, GroupType, MessageKind, NormalizedEvent};

use super::EventError;

/// Payload shapes emitted by the different producer versions.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// One object, either the message itself or an envelope with a nested `message`.
    Single(Map<String, Value>),
    /// `[message, targetId, groupType]`; the last two may be null.
    Triple {
        message: Map<String, Value>,
        target_id: Value,
        group_type: Value,
    },
}

impl EventPayload {
    /// Decodes invocation arguments into a known shape.
    ///
    /// # Errors
    /// Returns [`EventError::Malformed`] for arrays that are not 1 or 3 long, or when the
    /// message slot is not an object.
    pub fn decode(arguments: &Value) -> Result<Self, EventError> {
        match arguments {
            Value::Object(object) => Ok(Self::Single(object.clone())),
            Value::Array(items) => match items.as_slice() {
                [Value::Object(object)] => Ok(Self::Single(object.clone())),
                [Value::Object(object), target_id, group_type] => Ok(Self::Triple {
                    message: object.clone(),
                    target_id: target_id.clone(),
                    group_type: group_type.clone(),
                }),
                [_] | [_, _, _] => Err(EventError::Malformed(
                    "message slot is not an object".into(),
                )),
                other => Err(EventError::Malformed(format!(
                    "unsupported argument arity {}",
                    other.len()
                ))),
            },
            other => Err(EventError::Malformed(format!(
                "unsupported payload type {}",
                json_type(other)
            ))),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn lookup<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|name| object.get(*name).filter(|value| !value.is_null()))
}

/// Reads an id that producers send either as a JSON number or a numeric string.
pub(crate) fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn id_field(object: &Map<String, Value>, names: &[&str]) -> Option<i64> {
    lookup(object, names).and_then(as_id)
}

/// Resolves a group type from an explicit name, falling back to the legacy numeric
/// discriminator.
fn as_group_type(value: &Value) -> Option<GroupType> {
    match value {
        Value::String(text) => text.parse().ok(),
        Value::Number(number) => number.as_i64().map(GroupType::from_legacy_discriminator),
        _ => None,
    }
}

const MESSAGE_ID: &[&str] = &["id", "messageId", "message_id", "Id"];
const SENDER_ID: &[&str] = &["senderId", "sender_id", "SenderId"];
const TARGET_ID: &[&str] = &["targetId", "target_id", "receiverId", "receiver_id", "TargetId"];
const GROUP_TYPE: &[&str] = &["groupType", "group_type", "GroupType"];
const LEGACY_GROUP_TYPE: &[&str] = &["chatType", "groupKind", "legacyGroupType"];
const KIND: &[&str] = &["type", "messageType", "Type", "kind"];

/// Produces the canonical event record for an upstream invocation.
///
/// # Errors
/// Returns [`EventError::Malformed`] when the payload shape is unknown or the message carries
/// no recognizable type.
pub fn normalize(method: &str, arguments: &Value) -> Result<NormalizedEvent, EventError> {
    let action = EventAction::from_method(method);

    let (message, positional_target, positional_group) = match EventPayload::decode(arguments)? {
        EventPayload::Single(mut object) => match object.remove("message") {
            Some(Value::Object(inner)) => {
                let target = lookup(&object, TARGET_ID).cloned().unwrap_or(Value::Null);
                let group = lookup(&object, GROUP_TYPE)
                    .or_else(|| lookup(&object, LEGACY_GROUP_TYPE))
                    .cloned()
                    .unwrap_or(Value::Null);
                (inner, target, group)
            }
            Some(other) => {
                object.insert("message".into(), other);
                (object, Value::Null, Value::Null)
            }
            None => (object, Value::Null, Value::Null),
        },
        EventPayload::Triple {
            message,
            target_id,
            group_type,
        } => (message, target_id, group_type),
    };

    let kind = match lookup(&message, KIND) {
        Some(Value::String(text)) => text
            .parse::<MessageKind>()
            .map_err(|err| EventError::Malformed(err.to_string()))?,
        Some(_) => return Err(EventError::Malformed("message type is not a string".into())),
        None => match action {
            EventAction::PinUpdated => MessageKind::PinUpdate,
            EventAction::ReadConfirmed => MessageKind::ReadReceipt,
            _ => return Err(EventError::Malformed("message type missing".into())),
        },
    };

    let target_id = as_id(&positional_target).or_else(|| id_field(&message, TARGET_ID));

    let explicit_group = match &positional_group {
        Value::String(_) => as_group_type(&positional_group),
        _ => lookup(&message, GROUP_TYPE).and_then(as_group_type),
    };
    let legacy_group = match &positional_group {
        Value::Number(_) => as_group_type(&positional_group),
        _ => lookup(&message, LEGACY_GROUP_TYPE).and_then(as_group_type),
    };
    let group_type = explicit_group.or(legacy_group).or(match kind {
        MessageKind::Group => Some(GroupType::ClassGroup),
        MessageKind::Channel => Some(GroupType::Channel),
        MessageKind::Private => Some(GroupType::Private),
        _ => None,
    });

    Ok(NormalizedEvent {
        method: method.to_string(),
        action,
        kind,
        message_id: id_field(&message, MESSAGE_ID),
        sender_id: id_field(&message, SENDER_ID),
        target_id,
        group_type,
        other_party_id: None,
        message: Value::Object(message),
    })
}
