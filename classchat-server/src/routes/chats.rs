use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    app_state::AppState,
    handlers::{messages, read_state},
};

pub fn create_chat_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/chats/{group_type}/{target_id}/unread",
            get(read_state::get_unread),
        )
        .route(
            "/chats/{group_type}/{target_id}/messages",
            get(messages::get_window),
        )
        .route(
            "/chats/{group_type}/{target_id}/read",
            post(read_state::confirm_read),
        )
        .route(
            "/chats/{group_type}/{target_id}/read-all",
            post(read_state::mark_all_read),
        )
        .route(
            "/chats/{group_type}/{target_id}/messages/{message_id}/seen",
            get(read_state::seen_by),
        )
}
