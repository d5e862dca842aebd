use axum::{
    extract::multipart::MultipartRejection,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diesel::result::DatabaseErrorKind;
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

use crate::storage::StorageError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaKind {
    Count,
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Unauthorized,
    Conflict,
    QuotaExceeded(QuotaKind),
    Validation,
    StorageIo,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden | ErrorKind::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::StorageIo | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable identifier exposed to clients.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::QuotaExceeded(QuotaKind::Count) => "QUOTA_EXCEEDED_COUNT",
            ErrorKind::QuotaExceeded(QuotaKind::Bytes) => "QUOTA_EXCEEDED_BYTES",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::StorageIo => "STORAGE_IO",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct AppError {
    kind: ErrorKind,
    message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Unauthorized, "unauthorized")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound, "resource not found")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn quota_exceeded(kind: QuotaKind, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded(kind), message)
    }

    pub fn storage_io<E: Display>(error: E) -> Self {
        Self::new(ErrorKind::StorageIo, error.to_string())
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(ErrorKind::Internal, error.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        if status.is_server_error() {
            tracing::error!(error = %self.message, code = self.kind.code(), "request failed");
        }
        let body = Json(ErrorResponse {
            code: status.as_u16(),
            error: self.kind.code(),
            message: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: &'static str,
    message: String,
}

impl From<diesel::result::Error> for AppError {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::NotFound => AppError::not_found(),
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                AppError::conflict(format!("unique constraint violated: {}", info.message()))
            }
            _ => AppError::internal(value),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(key) => {
                AppError::new(ErrorKind::NotFound, format!("blob {key} not found"))
            }
            other => AppError::storage_io(other),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<JsonRejection> for AppError {
    fn from(value: JsonRejection) -> Self {
        AppError::bad_request(format!("invalid request body: {}", value.body_text()))
    }
}

impl From<PathRejection> for AppError {
    fn from(value: PathRejection) -> Self {
        AppError::bad_request(format!("invalid path parameter: {}", value.body_text()))
    }
}

impl From<QueryRejection> for AppError {
    fn from(value: QueryRejection) -> Self {
        AppError::bad_request(format!("invalid query string: {}", value.body_text()))
    }
}

impl From<MultipartRejection> for AppError {
    fn from(value: MultipartRejection) -> Self {
        AppError::bad_request(format!("invalid multipart request: {}", value.body_text()))
    }
}
