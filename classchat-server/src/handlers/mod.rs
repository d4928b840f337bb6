pub mod admin;
pub mod messages;
pub mod read_state;
pub mod streaming;

use shared::models::GroupType;

use crate::http::error::{ApiError, AppResult};

/// Parses the `{group_type}` path segment shared by the chat routes.
pub(crate) fn parse_group_type(raw: &str) -> AppResult<GroupType> {
    raw.parse::<GroupType>()
        .map_err(|err| ApiError::bad_request(err.to_string()))
}

pub(crate) fn ensure_positive(name: &'static str, value: i64) -> AppResult<i64> {
    if value > 0 {
        Ok(value)
    } else {
        Err(ApiError::bad_request(format!("{name} must be a positive id")))
    }
}
