use std::str::FromStr;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::debug;
use uuid::Uuid;

use crate::http::error::{ApiError, AppResult};
use shared::config::server::Config;

/// Per-request identity: a correlation id and the caller asserted by the gateway.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<i64>,
}

/// Caller id for handlers that need one.
///
/// # Errors
/// Returns 401 when the gateway did not supply a user.
pub fn require_user(context: &RequestContext) -> AppResult<i64> {
    context
        .user_id
        .ok_or_else(|| ApiError::unauthorized("missing caller identity"))
}

#[derive(Clone, Debug)]
pub struct RequestIdState {
    header: HeaderName,
    user_header: HeaderName,
}

impl RequestIdState {
    pub fn from_config(config: &Config) -> Self {
        let header = HeaderName::from_str(&config.server.request_id_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-request-id"));
        let user_header = HeaderName::from_str(&config.server.user_id_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-user-id"));
        Self {
            header,
            user_header,
        }
    }
}

pub async fn assign_request_id(
    State(state): State<RequestIdState>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let header_name = state.header.clone();
    let request_id = header_text(request.headers(), &header_name)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let user_id = header_text(request.headers(), &state.user_header).and_then(|raw| {
        let parsed = raw.parse::<i64>().ok().filter(|id| *id > 0);
        if parsed.is_none() {
            debug!(value = %raw, "ignoring unparseable caller identity header");
        }
        parsed
    });

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        user_id,
    });

    let encoded = HeaderValue::from_str(&request_id)
        .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?;
    request.headers_mut().insert(header_name.clone(), encoded.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(header_name, encoded);

    Ok(response)
}

fn header_text(headers: &HeaderMap, header: &HeaderName) -> Option<String> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
