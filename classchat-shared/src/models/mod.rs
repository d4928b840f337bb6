pub mod chat;
pub mod events;

pub use chat::{
    ChatMessage, ChatWindowResponse, ConfirmReadRequest, ConfirmReadResponse, GroupType,
    MarkAllReadResponse, ReadReceipt, RecomputeUnreadRequest, RecomputeUnreadResponse,
    ReconciliationSummary, SeenByResponse, UnreadCountResponse,
};
pub use events::{AudienceClass, AudienceKey, EventAction, MessageKind, NormalizedEvent};
