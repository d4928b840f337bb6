use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::problem::ProblemDetails;
use crate::{
    services::{
        pagination::PaginationError, read_tracking::ReadTrackingError,
        reconciliation::ReconciliationError,
    },
    store::StoreError,
};

pub type AppResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "dependency_unavailable", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let details = self.details;

        let mut problem = ProblemDetails::new(self.status, self.code, self.message);
        if let Some(details) = details {
            problem = problem.with_details(details);
        }

        problem.into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err
                .code()
                .unwrap_or_else(|| std::borrow::Cow::Borrowed("unknown"));
            let message = format!("database error {code}");
            return Self::internal_server_error(message)
                .with_details(json!({ "sqlstate": code, "message": db_err.message() }));
        }

        if matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) {
            return Self::service_unavailable(err.to_string());
        }

        Self::internal_server_error(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(db_err) => Self::from(db_err),
            StoreError::Corrupt(message) => Self::internal_server_error(message),
        }
    }
}

impl From<PaginationError> for ApiError {
    fn from(err: PaginationError) -> Self {
        match err {
            PaginationError::Store(store) => Self::from(store),
        }
    }
}

impl From<ReadTrackingError> for ApiError {
    fn from(err: ReadTrackingError) -> Self {
        match err {
            ReadTrackingError::Validation(message) => Self::bad_request(message),
            ReadTrackingError::Forbidden(message) => Self::forbidden(message),
            ReadTrackingError::Store(store) => Self::from(store),
            ReadTrackingError::Cache(cache) => Self::service_unavailable(cache.to_string()),
        }
    }
}

impl From<ReconciliationError> for ApiError {
    fn from(err: ReconciliationError) -> Self {
        match err {
            ReconciliationError::Cache(cache) => Self::service_unavailable(cache.to_string()),
            ReconciliationError::Store(store) => Self::from(store),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use axum::http::StatusCode;
    use http::header::CONTENT_TYPE;
    use serde_json::Value;

    #[test]
    fn new_sets_fields_and_allows_details() {
        let error = ApiError::forbidden("nope").with_details(json!({ "reason": "membership" }));
        assert_eq!(error.status, StatusCode::FORBIDDEN);
        assert_eq!(error.code, "forbidden");
        assert!(
            error
                .details
                .as_ref()
                .is_some_and(|details| details["reason"] == Value::from("membership"))
        );
    }

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::unauthorized("missing caller identity")
            .with_details(json!({ "header": "x-user-id" }))
            .into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body to bytes");
        let json: Value =
            serde_json::from_slice(&bytes).expect("problem details deserializes to json");
        assert_eq!(json["code"], "unauthorized");
        assert_eq!(json["type"], "https://classchat.dev/problems/unauthorized");
        assert_eq!(json["details"]["header"], "x-user-id");
    }

    #[test]
    fn read_tracking_errors_map_to_matching_status_codes() {
        let validation = ApiError::from(ReadTrackingError::Validation("bad".into()));
        assert_eq!(validation.status, StatusCode::BAD_REQUEST);

        let forbidden = ApiError::from(ReadTrackingError::Forbidden("nope".into()));
        assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

        let cache = ApiError::from(ReadTrackingError::Cache(CacheError::Timeout("set")));
        assert_eq!(cache.status, StatusCode::SERVICE_UNAVAILABLE);

        let corrupt = ApiError::from(ReadTrackingError::Store(StoreError::Corrupt("row".into())));
        assert_eq!(corrupt.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unreachable_database_is_a_dependency_failure() {
        let error = ApiError::from(PaginationError::Store(StoreError::Database(
            sqlx::Error::PoolTimedOut,
        )));
        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
