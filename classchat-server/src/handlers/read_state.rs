use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, State},
};
use shared::models::{
    ConfirmReadRequest, ConfirmReadResponse, MarkAllReadResponse, SeenByResponse,
    UnreadCountResponse,
};
use tracing::instrument;

use super::{ensure_positive, parse_group_type};
use crate::{
    app_state::AppState,
    http::error::AppResult,
    middleware::request_context::{RequestContext, require_user},
};

/// Unread counter of the caller for one chat.
#[utoipa::path(
    get,
    path = "/api/chats/{group_type}/{target_id}/unread",
    params(
        ("group_type" = String, Path, description = "class_group, channel or private"),
        ("target_id" = i64, Path, description = "Room id, or the other participant for private chats")
    ),
    responses(
        (status = 200, description = "Current unread count", body = UnreadCountResponse),
        (status = 400, description = "Unknown group type"),
        (status = 401, description = "Missing caller identity")
    ),
    tag = "ReadState"
)]
#[instrument(skip(state, context))]
pub async fn get_unread(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path((group_type, target_id)): Path<(String, i64)>,
) -> AppResult<Json<UnreadCountResponse>> {
    let user_id = require_user(&context)?;
    let group_type = parse_group_type(&group_type)?;
    let target_id = ensure_positive("target_id", target_id)?;

    let unread = state.read_tracker.unread(user_id, target_id, group_type).await;
    Ok(Json(UnreadCountResponse {
        target_id,
        group_type,
        unread,
    }))
}

#[utoipa::path(
    post,
    path = "/api/chats/{group_type}/{target_id}/read",
    params(
        ("group_type" = String, Path, description = "class_group, channel or private"),
        ("target_id" = i64, Path, description = "Room id, or the other participant for private chats")
    ),
    request_body = ConfirmReadRequest,
    responses(
        (status = 200, description = "Read pointer after the confirmation", body = ConfirmReadResponse),
        (status = 400, description = "Invalid message id or group type"),
        (status = 401, description = "Missing caller identity"),
        (status = 403, description = "Caller is not a member of the chat")
    ),
    tag = "ReadState"
)]
#[instrument(skip(state, context, payload))]
pub async fn confirm_read(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path((group_type, target_id)): Path<(String, i64)>,
    Json(payload): Json<ConfirmReadRequest>,
) -> AppResult<Json<ConfirmReadResponse>> {
    let user_id = require_user(&context)?;
    let group_type = parse_group_type(&group_type)?;
    let target_id = ensure_positive("target_id", target_id)?;

    let response = state
        .read_tracker
        .confirm_read(user_id, target_id, group_type, payload.message_id)
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/chats/{group_type}/{target_id}/read-all",
    params(
        ("group_type" = String, Path, description = "class_group, channel or private"),
        ("target_id" = i64, Path, description = "Room id, or the other participant for private chats")
    ),
    responses(
        (status = 200, description = "Chat marked as read", body = MarkAllReadResponse),
        (status = 401, description = "Missing caller identity"),
        (status = 403, description = "Caller is not a member of the chat")
    ),
    tag = "ReadState"
)]
#[instrument(skip(state, context))]
pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path((group_type, target_id)): Path<(String, i64)>,
) -> AppResult<Json<MarkAllReadResponse>> {
    let user_id = require_user(&context)?;
    let group_type = parse_group_type(&group_type)?;
    let target_id = ensure_positive("target_id", target_id)?;

    let response = state
        .read_tracker
        .mark_all_read(user_id, target_id, group_type)
        .await?;
    Ok(Json(response))
}

/// Users who have seen a message and are not yet reconciled into receipts.
#[utoipa::path(
    get,
    path = "/api/chats/{group_type}/{target_id}/messages/{message_id}/seen",
    params(
        ("group_type" = String, Path, description = "class_group, channel or private"),
        ("target_id" = i64, Path, description = "Room id, or the other participant for private chats"),
        ("message_id" = i64, Path, description = "Message id")
    ),
    responses(
        (status = 200, description = "Seen-by set", body = SeenByResponse),
        (status = 400, description = "Invalid id or group type"),
        (status = 401, description = "Missing caller identity"),
        (status = 403, description = "Caller is not a member of the chat")
    ),
    tag = "ReadState"
)]
#[instrument(skip(state, context))]
pub async fn seen_by(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path((group_type, target_id, message_id)): Path<(String, i64, i64)>,
) -> AppResult<Json<SeenByResponse>> {
    let user_id = require_user(&context)?;
    let group_type = parse_group_type(&group_type)?;
    let target_id = ensure_positive("target_id", target_id)?;
    let message_id = ensure_positive("message_id", message_id)?;

    let response = state
        .read_tracker
        .seen_by(user_id, target_id, group_type, message_id)
        .await?;
    Ok(Json(response))
}
