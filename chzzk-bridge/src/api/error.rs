//! API error handling.
//!
//! Every failure leaves the server as a fixed status plus a JSON body with a
//! machine-readable `code` and a human `message`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 400 Bad Request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// 400 for an authorization state that cannot be redeemed.
    pub fn invalid_state() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "STATE_NOT_FOUND",
            "Authorization state is unknown or expired, subscribe again",
        )
    }

    /// 406 when the subscriber already has a credential.
    pub fn credential_exists() -> Self {
        Self::new(
            StatusCode::NOT_ACCEPTABLE,
            "CREDENTIAL_EXISTS",
            "A credential is already registered for this subscriber",
        )
    }

    /// 500 when the platform refused the login.
    pub fn login_failed() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "LOGIN_FAILED",
            "Login to the platform failed",
        )
    }

    /// 500 when the live session could not be opened.
    pub fn session_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SESSION_UNAVAILABLE",
            message,
        )
    }

    /// 422 Unprocessable Entity.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
    }

    /// 404 Not Found.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// 500 Internal Server Error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { entity_type, id } => {
                ApiError::not_found(format!("{} with id '{}' not found", entity_type, id))
            }
            Error::Validation(msg) => ApiError::validation(msg),
            Error::DatabaseSqlx(e) => {
                tracing::error!("Database error: {}", e);
                ApiError::internal("Database error occurred")
            }
            Error::Io(e) => {
                tracing::error!("IO error: {}", e);
                ApiError::internal("IO error occurred")
            }
            Error::Gateway(e) => {
                tracing::warn!("Gateway error: {}", e);
                ApiError::login_failed()
            }
            _ => {
                tracing::error!("Unexpected error: {}", err);
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;

    #[test]
    fn test_api_error_creation() {
        let err = ApiError::credential_exists();
        assert_eq!(err.status, StatusCode::NOT_ACCEPTABLE);
        assert_eq!(err.code, "CREDENTIAL_EXISTS");
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err: ApiError = Error::DatabaseSqlx(sqlx::Error::RowNotFound).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Database error occurred");

        let err: ApiError = Error::Gateway(GatewayError::Transport("secret host".into())).into();
        assert_eq!(err.code, "LOGIN_FAILED");
        assert!(!err.message.contains("secret"));
    }

    #[test]
    fn test_error_body_shape() {
        let body = ApiErrorResponse {
            code: "BAD_REQUEST".to_string(),
            message: "Missing subscriber".to_string(),
            details: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "BAD_REQUEST");
        assert!(json.get("details").is_none());
    }
}
