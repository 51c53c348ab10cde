//! # Error Handling
//!
//! Application error type for the HTTP surface and how it is rendered.
//!
//! Most of the relay never produces an `AppError`: inside a conversation,
//! failures are logged and end that conversation through a close frame, and
//! startup errors go through `anyhow`. Only the upgrade endpoint reports errors
//! as HTTP responses.
//!
//! ## Error Categories:
//! - **BadRequest**: The upgrade request was not a valid WebSocket handshake (400)
//! - **Unavailable**: Conversation limit reached, try again later (503)
//!
//! Responses carry a plain-text body with the error message.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type("text/plain; charset=utf-8")
            .body(self.to_string())
    }
}
