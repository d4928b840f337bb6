#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{
    ChatMessage, ChatWindowResponse, ConfirmReadRequest, ConfirmReadResponse, GroupType,
    MarkAllReadResponse, RecomputeUnreadRequest, RecomputeUnreadResponse, ReconciliationSummary,
    SeenByResponse, UnreadCountResponse,
};
use utoipa::OpenApi;

use crate::http::problem::ProblemDetails;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "ClassChat API",
        version = "1.0.0",
        description = "Unread counters, read confirmations, message windows and live chat events"
    ),
    paths(
        crate::handlers::read_state::get_unread,
        crate::handlers::read_state::confirm_read,
        crate::handlers::read_state::mark_all_read,
        crate::handlers::read_state::seen_by,
        crate::handlers::messages::get_window,
        crate::handlers::admin::recompute_unread,
        crate::handlers::admin::reconcile_now,
        crate::handlers::streaming::sse_handler,
    ),
    components(
        schemas(
            GroupType,
            ChatMessage,
            ChatWindowResponse,
            UnreadCountResponse,
            ConfirmReadRequest,
            ConfirmReadResponse,
            MarkAllReadResponse,
            SeenByResponse,
            RecomputeUnreadRequest,
            RecomputeUnreadResponse,
            ReconciliationSummary,
            ProblemDetails,
        )
    ),
    tags(
        (name = "ReadState", description = "Unread counters, read pointers and seen-by sets"),
        (name = "Messages", description = "Paginated message windows"),
        (name = "Admin", description = "Support operations"),
        (name = "Stream", description = "Server-sent chat events")
    )
)]
pub struct ApiDoc;
