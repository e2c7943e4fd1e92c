//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    /// Missing env vars are echoed back so the caller can prompt for them.
    #[error("missing required environment variables")]
    MissingEnvVars(Vec<String>),

    // Resource errors
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),

    // Rate limiting
    #[error("Too many requests")]
    RateLimited,
    #[error("{message}")]
    DailyLimitExceeded { message: String },

    // Availability
    #[error("{0}")]
    ServiceUnavailable(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // The daily quota error carries the contract body shape used by
        // proxy clients; everything else uses the standard envelope.
        if let ApiError::DailyLimitExceeded { message } = &self {
            let body = Json(json!({
                "success": false,
                "error_code": "DAILY_LIMIT_EXCEEDED",
                "message": message,
            }));
            return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        }

        if let ApiError::MissingEnvVars(vars) = &self {
            let body = Json(json!({
                "success": false,
                "message": format!("missing required environment variables: {}", vars.join(", ")),
                "data": { "required_env_vars": vars },
            }));
            return (StatusCode::BAD_REQUEST, body).into_response();
        }

        let (status, code, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::MissingEnvVars(_) => unreachable!(),

            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", self.to_string()),
            ApiError::DailyLimitExceeded { .. } => unreachable!(),

            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone())
            }

            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            other => ApiError::Database(other.to_string()),
        }
    }
}

impl From<mcpgate_shared::GatewayError> for ApiError {
    fn from(err: mcpgate_shared::GatewayError) -> Self {
        use mcpgate_shared::GatewayError;
        match err {
            GatewayError::Auth(msg) => {
                tracing::warn!("auth failure: {}", msg);
                ApiError::Unauthorized
            }
            GatewayError::NotFound(msg) => ApiError::NotFound(msg),
            GatewayError::Validation(msg) => ApiError::Validation(msg),
            GatewayError::Conflict(msg) => ApiError::Conflict(msg),
            GatewayError::RateLimited => ApiError::RateLimited,
            GatewayError::Timeout(msg) => ApiError::ServiceUnavailable(msg),
            GatewayError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
            GatewayError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
