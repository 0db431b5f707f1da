use crate::models::InteractionKind;
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use thiserror::Error;

/// Failures of learner actions against an attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AttemptError {
    #[error("attempt has already been submitted")]
    Submitted,
    #[error("time limit for this attempt has expired")]
    TimeExpired,
    #[error("unknown item '{0}'")]
    UnknownItem(String),
    #[error("unknown section kind '{0}'")]
    UnknownSectionKind(String),
    #[error("position {0} is outside the exam")]
    InvalidPosition(usize),
    #[error("item '{item_id}' expects a {expected} response, got {got}")]
    ShapeMismatch {
        item_id: String,
        expected: InteractionKind,
        got: InteractionKind,
    },
}

/// Attempt-store failures. Never shown to the learner.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored record is not valid json: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub issue: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Vec::new(),
            request_id: request_id.into(),
        }
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn from_attempt(err: AttemptError, request_id: impl Into<String>) -> Self {
        let (status, code) = match &err {
            AttemptError::Submitted => (StatusCode::CONFLICT, "ATTEMPT_SUBMITTED"),
            AttemptError::TimeExpired => (StatusCode::CONFLICT, "TIME_EXPIRED"),
            AttemptError::UnknownItem(_) => (StatusCode::NOT_FOUND, "UNKNOWN_ITEM"),
            AttemptError::UnknownSectionKind(_) => (StatusCode::NOT_FOUND, "UNKNOWN_SECTION"),
            AttemptError::InvalidPosition(_) => (StatusCode::BAD_REQUEST, "INVALID_POSITION"),
            AttemptError::ShapeMismatch { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "SHAPE_MISMATCH"),
        };
        Self::new(status, code, err.to_string(), request_id)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let payload = ErrorBody {
            error: ErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
                request_id: self.request_id,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}
