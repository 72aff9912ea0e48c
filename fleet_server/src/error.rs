use std::io::Cursor;

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use rocket::http::{ContentType, Status};
use rocket::response::{self, Responder, Response};
use rocket::Request;
use thiserror::Error;

/// Errors produced by the host directory, carve store and reconciler.
#[derive(Error, Debug)]
pub enum FleetError {
    /// A lookup missed: the record never existed (or was deleted).
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// The host re-enrolled inside its cooldown window.
    #[error("host {osquery_host_id} enrolled too recently, retry after cooldown")]
    EnrollmentThrottled { osquery_host_id: String },

    /// Uniqueness violated, e.g. a reused carve session id.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The carve existed but its blocks were reclaimed by the cleanup sweep.
    #[error("carve session {session_id} has expired")]
    Expired { session_id: String },

    /// Malformed input: bad identifiers, out of range block indices, ...
    #[error("invalid input: {0}")]
    Validation(String),

    /// Underlying persistence failure.
    #[error("storage error: {0}")]
    Storage(DieselError),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        FleetError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        FleetError::Validation(msg.into())
    }

    fn status(&self) -> Status {
        match self {
            FleetError::NotFound { .. } => Status::NotFound,
            FleetError::EnrollmentThrottled { .. } => Status::TooManyRequests,
            FleetError::Conflict(_) => Status::Conflict,
            FleetError::Expired { .. } => Status::Gone,
            FleetError::Validation(_) => Status::UnprocessableEntity,
            _ => Status::InternalServerError,
        }
    }
}

impl From<DieselError> for FleetError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                FleetError::Conflict(info.message().to_string())
            }
            other => FleetError::Storage(other),
        }
    }
}

impl<'r> Responder<'r, 'static> for FleetError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status == Status::InternalServerError {
            log::error!("request failed: {}", self);
        }

        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        Response::build()
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
