use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, State},
};
use shared::models::{
    AudienceClass, RecomputeUnreadRequest, RecomputeUnreadResponse, ReconciliationSummary,
};
use tracing::{info, instrument, warn};

use super::ensure_positive;
use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    middleware::request_context::{RequestContext, require_user},
};

/// Support operations are reserved for school personnel.
async fn require_operator(state: &AppState, context: &RequestContext) -> AppResult<i64> {
    let operator = require_user(context)?;
    let classes = state
        .directory
        .audience_classes(operator)
        .await
        .map_err(ApiError::from)?;
    if classes.contains(&AudienceClass::Personnel) {
        Ok(operator)
    } else {
        warn!(operator, "admin operation refused");
        Err(ApiError::forbidden("admin operations require a personnel account"))
    }
}

/// Rebuilds one unread counter from the durable message store.
#[utoipa::path(
    post,
    path = "/api/admin/unread/recompute",
    request_body = RecomputeUnreadRequest,
    responses(
        (status = 200, description = "Recomputed counter", body = RecomputeUnreadResponse),
        (status = 401, description = "Missing caller identity"),
        (status = 403, description = "Caller is not personnel"),
        (status = 503, description = "Cache or store unavailable")
    ),
    tag = "Admin"
)]
#[instrument(skip(state, context, payload))]
pub async fn recompute_unread(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Json(payload): Json<RecomputeUnreadRequest>,
) -> AppResult<Json<RecomputeUnreadResponse>> {
    let operator = require_operator(&state, &context).await?;
    let user_id = ensure_positive("user_id", payload.user_id)?;
    let target_id = ensure_positive("target_id", payload.target_id)?;

    let response = state
        .read_tracker
        .recompute_unread(user_id, target_id, payload.group_type)
        .await?;
    info!(
        operator,
        user_id,
        target_id,
        unread = response.unread,
        "unread counter recomputed"
    );
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/admin/reconcile",
    responses(
        (status = 200, description = "Summary of the pass", body = ReconciliationSummary),
        (status = 401, description = "Missing caller identity"),
        (status = 403, description = "Caller is not personnel"),
        (status = 503, description = "Cache unavailable")
    ),
    tag = "Admin"
)]
#[instrument(skip(state, context))]
pub async fn reconcile_now(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<ReconciliationSummary>> {
    let operator = require_operator(&state, &context).await?;
    info!(operator, "manual reconciliation pass requested");
    let summary = state
        .reconciliation
        .run_once(&state.shutdown.child_token())
        .await?;
    Ok(Json(summary))
}
