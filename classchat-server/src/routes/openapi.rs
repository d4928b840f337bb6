use std::sync::Arc;

use crate::{app_state::AppState, openapi::ApiDoc};
use axum::{
    Json, Router,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use utoipa::OpenApi;

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

async fn openapi_yaml() -> impl IntoResponse {
    match ApiDoc::openapi().to_yaml() {
        Ok(yaml) => (StatusCode::OK, [(header::CONTENT_TYPE, "application/yaml")], yaml),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("YAML error: {e}"),
        ),
    }
}

pub fn openapi_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/openapi/classchat.json", get(openapi_json))
        .route("/openapi/classchat.yaml", get(openapi_yaml))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{json_body, test_state};
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    #[tokio::test]
    async fn json_document_lists_chat_paths() {
        let response = openapi_routes()
            .with_state(test_state())
            .oneshot(
                Request::builder()
                    .uri("/openapi/classchat.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = json_body(response).await;
        let paths = doc["paths"].as_object().unwrap();
        assert!(paths.contains_key("/api/chats/{group_type}/{target_id}/unread"));
        assert!(paths.contains_key("/api/admin/reconcile"));
        assert!(paths.contains_key("/api/stream"));
    }

    #[tokio::test]
    async fn yaml_document_is_served() {
        let response = openapi_routes()
            .with_state(test_state())
            .oneshot(
                Request::builder()
                    .uri("/openapi/classchat.yaml")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("ClassChat API"));
    }
}
