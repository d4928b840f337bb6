use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query, State},
};
use serde::Deserialize;
use shared::models::ChatWindowResponse;
use tracing::instrument;
use utoipa::IntoParams;

use super::{ensure_positive, parse_group_type};
use crate::{
    app_state::AppState,
    http::error::AppResult,
    middleware::request_context::{RequestContext, require_user},
    services::pagination::WindowRequest,
};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct WindowQuery {
    /// Anchor message id; absent or non-positive opens the chat at the read pointer.
    cursor: Option<i64>,
    #[serde(default)]
    load_older: bool,
    /// Centre the window on `cursor` (jump to message).
    #[serde(default)]
    both_directions: bool,
    page_size: Option<usize>,
}

/// Window of messages for the caller's chat view.
#[utoipa::path(
    get,
    path = "/api/chats/{group_type}/{target_id}/messages",
    params(
        ("group_type" = String, Path, description = "class_group, channel or private"),
        ("target_id" = i64, Path, description = "Room id, or the other participant for private chats"),
        WindowQuery
    ),
    responses(
        (status = 200, description = "Ascending message window; empty when the caller has no access", body = ChatWindowResponse),
        (status = 400, description = "Unknown group type"),
        (status = 401, description = "Missing caller identity")
    ),
    tag = "Messages"
)]
#[instrument(skip(state, context))]
pub async fn get_window(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path((group_type, target_id)): Path<(String, i64)>,
    Query(query): Query<WindowQuery>,
) -> AppResult<Json<ChatWindowResponse>> {
    let user_id = require_user(&context)?;
    let group_type = parse_group_type(&group_type)?;
    let target_id = ensure_positive("target_id", target_id)?;

    let window = state
        .pagination
        .get_window(WindowRequest {
            target_id,
            group_type,
            user_id,
            cursor: query.cursor,
            load_older: query.load_older,
            both_directions: query.both_directions,
            page_size: query.page_size,
        })
        .await?;
    Ok(Json(window))
}
