use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::rate_limit::{LimitType, Window};

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limited ({}, {}): retry after {retry_after}s", .limit_type.as_str(), .window.as_str())]
    RateLimited {
        retry_after: u64,
        limit_type: LimitType,
        window: Window,
    },
}

impl AppError {
    fn rate_limited_response(retry_after: u64, limit_type: LimitType, window: Window) -> Response {
        let body = Json(json!({
            "error": format!("Rate limit exceeded. Please try again in {retry_after} seconds."),
            "retryAfter": retry_after,
            "quotaExceeded": true,
            "limitType": limit_type,
            "window": window,
        }));

        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        response
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::RateLimited {
                retry_after,
                limit_type,
                window,
            } => return Self::rate_limited_response(*retry_after, *limit_type, *window),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
