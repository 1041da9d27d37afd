//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **RelayError**: failures inside the audio relay itself (upstream connect, frame send,
//!   base64 decode, graceful finish, event handler faults). Almost all of these are absorbed
//!   and logged by the caller; only `ConnectFailed` is reported to the client as a status change.
//! - **AppError**: failures of the plain HTTP endpoints, converted to JSON responses through
//!   actix's `ResponseError` trait.
//!
//! ## Key Rust Concepts Used:
//! - **enum variants with data**: each variant carries a human-readable message
//! - **Display trait**: controls how the error is formatted in logs and responses
//! - **From trait**: lets `?` convert library errors into our own types automatically

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures that can happen while relaying audio for one session.
///
/// ## Error Policy:
/// - **ConnectFailed**: the upstream handshake failed; the client receives `connection_error`
/// - **SendFailed**: one audio frame could not be queued; logged, the session continues
/// - **DecodeFailed**: malformed base64 audio; the frame is dropped, the session continues
/// - **FinishFailed**: graceful close failed; logged, the registry entry is still removed
/// - **HandlerFault**: an event callback panicked; caught at the callback boundary
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    ConnectFailed(String),
    SendFailed(String),
    DecodeFailed(String),
    FinishFailed(String),
    HandlerFault(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::ConnectFailed(msg) => write!(f, "Upstream connect failed: {}", msg),
            RelayError::SendFailed(msg) => write!(f, "Audio send failed: {}", msg),
            RelayError::DecodeFailed(msg) => write!(f, "Audio decode failed: {}", msg),
            RelayError::FinishFailed(msg) => write!(f, "Upstream finish failed: {}", msg),
            RelayError::HandlerFault(msg) => write!(f, "Event handler fault: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

/// Errors returned by the config endpoint.
///
/// ## Error Categories:
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts AppError into a JSON HTTP response.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Keep-alive timeout must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// JSON parsing errors are the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}
