use std::sync::Arc;

use axum::{Router, routing::post};

use crate::{
    app_state::AppState,
    handlers::admin::{recompute_unread, reconcile_now},
};

pub fn create_router_admin() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/unread/recompute", post(recompute_unread))
        .route("/admin/reconcile", post(reconcile_now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{json_body, request, serve, test_state};
    use axum::http::StatusCode;
    use serde_json::json;
    use shared::models::GroupType;
    use tower::ServiceExt;

    fn app(state: Arc<AppState>) -> Router {
        serve(Router::new().nest("/api", create_router_admin()), state)
    }

    #[tokio::test]
    async fn recompute_rebuilds_counter_from_history() {
        let state = test_state();
        state.read_state.set_last_read(100, 7, GroupType::ClassGroup, 53).await;

        let response = app(Arc::clone(&state))
            .oneshot(request(
                "POST",
                "/api/admin/unread/recompute",
                Some(1),
                Some(json!({"user_id": 100, "target_id": 7, "group_type": "class_group"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["unread"], 2);
        assert_eq!(
            state.read_state.get_unread(100, 7, GroupType::ClassGroup).await,
            2
        );
    }

    #[tokio::test]
    async fn reconcile_drains_seen_sets() {
        let state = test_state();
        state
            .read_tracker
            .confirm_read(100, 7, GroupType::ClassGroup, 55)
            .await
            .unwrap();

        let summary = json_body(
            app(Arc::clone(&state))
                .oneshot(request("POST", "/api/admin/reconcile", Some(1), None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(summary["receipts_inserted"], 1);
        assert_eq!(summary["keys_deleted"], 1);
        let seen = state
            .read_tracker
            .seen_by(100, 7, GroupType::ClassGroup, 55)
            .await
            .unwrap();
        assert_eq!(seen.count, 0);
    }

    #[tokio::test]
    async fn admin_routes_refuse_non_personnel() {
        let app = app(test_state());
        for caller in [100, 5] {
            let response = app
                .clone()
                .oneshot(request("POST", "/api/admin/reconcile", Some(caller), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }

        let response = app
            .oneshot(request(
                "POST",
                "/api/admin/unread/recompute",
                Some(101),
                Some(json!({"user_id": 100, "target_id": 7, "group_type": "class_group"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_routes_require_a_caller() {
        let response = app(test_state())
            .oneshot(request("POST", "/api/admin/reconcile", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
