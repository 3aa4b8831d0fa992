//! The HTTP error surface.
//!
//! Route handlers return `Result<_, ApiError>` and rely on the `From` impls
//! below to map subsystem errors onto statuses: a revoked mailbox is a 409
//! the client must resolve by reconnecting, while transient provider and
//! database trouble stays a 500 so at-least-once callers redeliver.

use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use serde::Serialize;
use std::io::Cursor;

use crate::ingest::notifications::PushError;
use crate::ingest::provider::ProviderError;
use crate::ingest::watcher::PollError;

#[derive(Debug)]
pub enum ApiError {
    DatabaseError(sqlx::Error),
    NotFound(String),
    BadRequest(String),
    /// The mailbox credentials were rejected and the account has been marked
    /// disconnected; retrying without a reconnect cannot succeed.
    MailboxDisconnected(String),
    InternalError(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let (status, error_type, message) = match self {
            ApiError::DatabaseError(e) => {
                log::error!("database error: {}", e);
                (Status::InternalServerError, "DatabaseError", e.to_string())
            }
            ApiError::NotFound(msg) => {
                log::debug!("not found: {}", msg);
                (Status::NotFound, "NotFound", msg)
            }
            ApiError::BadRequest(msg) => {
                log::debug!("bad request: {}", msg);
                (Status::BadRequest, "BadRequest", msg)
            }
            ApiError::MailboxDisconnected(msg) => {
                log::warn!("mailbox disconnected: {}", msg);
                (Status::Conflict, "MailboxDisconnected", msg)
            }
            ApiError::InternalError(msg) => {
                log::error!("internal error: {}", msg);
                (Status::InternalServerError, "InternalError", msg)
            }
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
        };

        let json = serde_json::to_string(&error_response)
            .unwrap_or_else(|_| r#"{"error":"SerializationError","message":"Failed to serialize error"}"#.to_string());

        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(json.len(), Cursor::new(json))
            .ok()
    }
}

impl rocket_okapi::response::OpenApiResponderInner for ApiError {
    fn responses(
        _gen: &mut rocket_okapi::r#gen::OpenApiGenerator,
    ) -> rocket_okapi::Result<rocket_okapi::okapi::openapi3::Responses> {
        Ok(rocket_okapi::okapi::openapi3::Responses::default())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            _ => ApiError::DatabaseError(err),
        }
    }
}

impl From<PollError> for ApiError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Provider(ProviderError::Credential(reason)) => {
                ApiError::MailboxDisconnected(reason)
            }
            PollError::Database(e) => e.into(),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<PushError> for ApiError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::Envelope(msg) => ApiError::BadRequest(msg),
            PushError::Provider(ProviderError::Credential(reason)) => {
                ApiError::MailboxDisconnected(reason)
            }
            PushError::Database(e) => e.into(),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}
