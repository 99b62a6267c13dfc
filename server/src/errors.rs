use actix_web::{error::ResponseError, HttpResponse};
use derive_more::Display;
use diesel::result::{DatabaseErrorKind, Error as DBError};
use serde::{Deserialize, Serialize};
use std::convert::From;
use utoipa::ToSchema;
use uuid::Error as ParseError;

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Stable error envelope returned by every surface: `{"error": {"code", "message"}}`.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct ErrorResponseBody {
    pub error: ErrorBody,
}

impl ErrorResponseBody {
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        ErrorResponseBody {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Display, Clone)]
pub enum ServiceError {
    #[display("Internal Server Error: {_0}")]
    InternalServerError(String),

    #[display("Bad Request: {_0}")]
    BadRequest(String),

    #[display("Unauthorized")]
    Unauthorized,

    #[display("Forbidden")]
    Forbidden,

    #[display("Not Found: {_0}")]
    NotFound(String),

    #[display("Conflict: {_0}")]
    Conflict(String),

    #[display("Rate Limited")]
    RateLimited,

    #[display("Payload Too Large")]
    PayloadTooLarge,

    #[display("Service Unavailable: {_0}")]
    ServiceUnavailable(String),

    #[display("Json Deserialization Error: {_0}")]
    JsonDeserializeError(String),
}

impl ResponseError for ServiceError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ServiceError::InternalServerError(ref message) => {
                log::error!("Internal server error: {}", message);
                HttpResponse::InternalServerError()
                    .json(ErrorResponseBody::new("internal", message.clone()))
            }
            ServiceError::BadRequest(ref message) => HttpResponse::BadRequest()
                .json(ErrorResponseBody::new("invalid_request", message.clone())),
            ServiceError::Unauthorized => HttpResponse::Unauthorized()
                .json(ErrorResponseBody::new("unauthorized", "Unauthorized")),
            ServiceError::Forbidden => {
                HttpResponse::Forbidden().json(ErrorResponseBody::new("forbidden", "Forbidden"))
            }
            ServiceError::NotFound(ref message) => HttpResponse::NotFound().json(
                ErrorResponseBody::new("not_found", format!("Not Found: {}", message)),
            ),
            ServiceError::Conflict(ref message) => {
                HttpResponse::Conflict().json(ErrorResponseBody::new("conflict", message.clone()))
            }
            ServiceError::RateLimited => HttpResponse::TooManyRequests()
                .json(ErrorResponseBody::new("rate_limited", "Too many requests")),
            ServiceError::PayloadTooLarge => HttpResponse::PayloadTooLarge().json(
                ErrorResponseBody::new("invalid_request", "Uploaded file exceeds the size limit"),
            ),
            ServiceError::ServiceUnavailable(ref message) => HttpResponse::ServiceUnavailable()
                .json(ErrorResponseBody::new("unavailable", message.clone())),
            ServiceError::JsonDeserializeError(ref message) => {
                HttpResponse::BadRequest().json(ErrorResponseBody::new(
                    "invalid_request",
                    format!("Json Deserialization Error: {}", message),
                ))
            }
        }
    }
}

impl From<ParseError> for ServiceError {
    fn from(_: ParseError) -> ServiceError {
        ServiceError::BadRequest("Invalid UUID".into())
    }
}

impl From<DBError> for ServiceError {
    fn from(error: DBError) -> ServiceError {
        match error {
            DBError::NotFound => ServiceError::NotFound("Record not found".into()),
            DBError::DatabaseError(kind, info) => {
                if let DatabaseErrorKind::UniqueViolation = kind {
                    let message = info.details().unwrap_or_else(|| info.message()).to_string();
                    return ServiceError::Conflict(message);
                }
                ServiceError::InternalServerError("Unknown DB Error. Please try again later".into())
            }
            _ => ServiceError::InternalServerError(
                "Internal Server Error. Please try again later".into(),
            ),
        }
    }
}

/// Error sum for the ingestion pipeline. The task manager pattern-matches on
/// this to decide between retry, permanent failure, and cooperative stop.
#[derive(Debug, Display, Clone)]
pub enum PipelineError {
    /// Network timeouts, 5xx from model/index stores, lost leases.
    #[display("transient: {_0}")]
    Transient(String),

    /// Blob store unavailable past its retry budget. The task manager
    /// requeues without consuming an attempt: the task stalls, it does not
    /// fail.
    #[display("stalled: {_0}")]
    Stalled(String),

    /// Unparseable or unsupported input. Never retried; the version is
    /// marked failed with a user-facing message.
    #[display("permanent: {_0}")]
    PermanentInput(String),

    /// Caller lacked rights for an operation discovered mid-pipeline.
    #[display("permission: {_0}")]
    Permission(String),

    /// Cross-store inconsistency. Logged and surfaced to the cleanup CLI
    /// candidate set, never auto-deleted.
    #[display("invariant: {_0}")]
    Invariant(String),

    /// Cooperative cancellation observed at a checkpoint. Not an error.
    #[display("cancelled")]
    Cancelled,
}

impl From<ServiceError> for PipelineError {
    fn from(err: ServiceError) -> PipelineError {
        match err {
            ServiceError::BadRequest(msg) | ServiceError::JsonDeserializeError(msg) => {
                PipelineError::PermanentInput(msg)
            }
            ServiceError::Forbidden | ServiceError::Unauthorized => {
                PipelineError::Permission("not permitted".to_string())
            }
            ServiceError::NotFound(msg) => PipelineError::Invariant(msg),
            other => PipelineError::Transient(other.to_string()),
        }
    }
}

impl From<DBError> for PipelineError {
    fn from(error: DBError) -> PipelineError {
        match error {
            DBError::NotFound => PipelineError::Invariant("record not found".into()),
            other => PipelineError::Transient(format!("database error: {}", other)),
        }
    }
}
