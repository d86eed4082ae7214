use std::io;

use axum::Json;
use axum::http::header::{ALLOW, CONTENT_RANGE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::storage::sys;
use crate::utils::logging::ERROR_TARGET;

/// Failures of the storage engine, below the HTTP boundary.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("chunk {0} not found")]
    NotFound(String),

    #[error("chunk {0} already exists")]
    AlreadyExists(String),

    #[error("checksum mismatch: declared {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("size mismatch: declared {declared} bytes, received {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("range not satisfiable for a chunk of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("basedir {basedir} is owned by namespace `{namespace}` at `{address}`")]
    LockConflict {
        basedir: String,
        namespace: String,
        address: String,
    },

    #[error(
        "basedir {basedir} holds chunks sharded with width={width} depth={depth}, refusing width={requested_width} depth={requested_depth}"
    )]
    LayoutConflict {
        basedir: String,
        width: usize,
        depth: usize,
        requested_width: usize,
        requested_depth: usize,
    },

    #[error("corrupt metadata on chunk {id}: {reason}")]
    CorruptMetadata { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Turns `NotFound` I/O errors into [`StorageError::NotFound`] for `id`.
    pub fn from_io(id: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(id.to_string()),
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(id.to_string()),
            _ => StorageError::Io(err),
        }
    }
}

/// Errors crossing the HTTP boundary. Every variant maps to a status code
/// and a JSON body; nothing lower-level reaches the client as is.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid chunk id: {0}")]
    InvalidChunkId(String),

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl AppError {
    pub fn invalid_header(name: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::InvalidHeader {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidChunkId(_) | Self::InvalidHeader { .. } | Self::InvalidRange(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Storage(err) => match err {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                StorageError::AlreadyExists(_) => StatusCode::CONFLICT,
                StorageError::ChecksumMismatch { .. } | StorageError::SizeMismatch { .. } => {
                    StatusCode::BAD_REQUEST
                }
                StorageError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
                StorageError::Io(e) => io_status(e),
                StorageError::LockConflict { .. }
                | StorageError::LayoutConflict { .. }
                | StorageError::CorruptMetadata { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Io(e) => io_status(e),
        }
    }
}

fn io_status(err: &io::Error) -> StatusCode {
    if sys::is_no_space(err) {
        return StatusCode::INSUFFICIENT_STORAGE;
    }
    match err.kind() {
        // the request body broke off before its end
        io::ErrorKind::UnexpectedEof => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        if status_code.is_server_error() {
            tracing::error!(target: ERROR_TARGET, status = status_code.as_u16(), "{self}");
        } else {
            tracing::debug!(target: ERROR_TARGET, status = status_code.as_u16(), "{self}");
        }

        let body = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
            }
        });
        let mut response = (status_code, Json(body)).into_response();

        match &self {
            Self::Storage(StorageError::RangeNotSatisfiable { size }) => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    response.headers_mut().insert(CONTENT_RANGE, value);
                }
            }
            Self::MethodNotAllowed(_) => {
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static("GET, HEAD, PUT, DELETE"));
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppError::InvalidChunkId("zz".into()), StatusCode::BAD_REQUEST),
            (StorageError::NotFound("A".into()).into(), StatusCode::NOT_FOUND),
            (StorageError::AlreadyExists("A".into()).into(), StatusCode::CONFLICT),
            (
                StorageError::ChecksumMismatch {
                    expected: "00".into(),
                    actual: "11".into(),
                }
                .into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                StorageError::RangeNotSatisfiable { size: 3 }.into(),
                StatusCode::RANGE_NOT_SATISFIABLE,
            ),
            (
                StorageError::Io(io::Error::from_raw_os_error(libc::ENOSPC)).into(),
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (
                AppError::Io(io::Error::from(io::ErrorKind::PermissionDenied)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::MethodNotAllowed(Method::POST), StatusCode::METHOD_NOT_ALLOWED),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{err}");
        }
    }

    #[test]
    fn test_from_io_classifies_not_found() {
        let err = StorageError::from_io("AB", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, StorageError::NotFound(id) if id == "AB"));
        let err = StorageError::from_io("AB", io::Error::from(io::ErrorKind::Other));
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn test_range_error_carries_content_range() {
        let response = AppError::from(StorageError::RangeNotSatisfiable { size: 10 }).into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */10");
    }
}
