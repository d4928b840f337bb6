use serde_json::Value;
use shared::models::{AudienceClass, AudienceKey, GroupType, MessageKind, NormalizedEvent};

use super::{EventError, payload::as_id};

/// One normalized event addressed to one downstream channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub audience: AudienceKey,
    pub event: NormalizedEvent,
}

const BROADCAST_TARGETS: &[&str] = &["targetIds", "target_ids", "targets", "recipients", "TargetIds"];

fn broadcast_targets(event: &NormalizedEvent) -> Vec<i64> {
    BROADCAST_TARGETS
        .iter()
        .find_map(|name| event.message.get(*name).and_then(Value::as_array))
        .map(|items| items.iter().filter_map(as_id).collect())
        .unwrap_or_default()
}

fn class_for(kind: MessageKind) -> Option<AudienceClass> {
    match kind {
        MessageKind::AllTeachers => Some(AudienceClass::Teachers),
        MessageKind::AllStudents => Some(AudienceClass::Students),
        MessageKind::AllPersonnel => Some(AudienceClass::Personnel),
        MessageKind::PinUpdate => Some(AudienceClass::PinWatchers),
        MessageKind::ReadReceipt => Some(AudienceClass::ReceiptWatchers),
        _ => None,
    }
}

/// Expands a normalized event into its per-audience deliveries.
///
/// # Errors
/// Returns [`EventError::Malformed`] when a private or room message lacks the ids needed to
/// address it.
pub fn resolve(event: &NormalizedEvent) -> Result<Vec<Delivery>, EventError> {
    match event.kind {
        MessageKind::Private => {
            let sender = event
                .sender_id
                .ok_or_else(|| EventError::Malformed("private message without sender".into()))?;
            let receiver = event
                .target_id
                .ok_or_else(|| EventError::Malformed("private message without receiver".into()))?;

            Ok([(receiver, sender), (sender, receiver)]
                .into_iter()
                .map(|(recipient, other_party)| Delivery {
                    audience: AudienceKey::Private(recipient),
                    event: NormalizedEvent {
                        target_id: Some(other_party),
                        group_type: Some(GroupType::Private),
                        other_party_id: Some(other_party),
                        ..event.clone()
                    },
                })
                .collect())
        }
        MessageKind::Group | MessageKind::Channel => {
            let target = event
                .target_id
                .ok_or_else(|| EventError::Malformed("room message without target".into()))?;
            let group_type = match event.group_type {
                Some(GroupType::Private) | None => {
                    if event.kind == MessageKind::Group {
                        GroupType::ClassGroup
                    } else {
                        GroupType::Channel
                    }
                }
                Some(group_type) => group_type,
            };
            Ok(vec![Delivery {
                audience: AudienceKey::for_target(group_type, target),
                event: NormalizedEvent {
                    group_type: Some(group_type),
                    ..event.clone()
                },
            }])
        }
        MessageKind::BroadcastToGroups | MessageKind::BroadcastToUsers => {
            let targets = broadcast_targets(event);
            if targets.is_empty() {
                return Ok(vec![Delivery {
                    audience: AudienceKey::Class(AudienceClass::All),
                    event: event.clone(),
                }]);
            }

            let group_type = if event.kind == MessageKind::BroadcastToGroups {
                GroupType::ClassGroup
            } else {
                GroupType::Private
            };
            Ok(targets
                .into_iter()
                .map(|target| Delivery {
                    audience: AudienceKey::for_target(group_type, target),
                    event: NormalizedEvent {
                        target_id: Some(target),
                        group_type: Some(group_type),
                        ..event.clone()
                    },
                })
                .collect())
        }
        kind => {
            let class = class_for(kind).unwrap_or(AudienceClass::All);
            Ok(vec![Delivery {
                audience: AudienceKey::Class(class),
                event: event.clone(),
            }])
        }
    }
}
