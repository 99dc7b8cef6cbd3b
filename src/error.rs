// src/error.rs
//! Classified store failures and their HTTP status / machine-readable code mapping
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Failures the HTTP layer knows how to report with a specific status.
///
/// Everything else travels as a plain `anyhow::Error` and is reported as a
/// 500. Variants carry owned strings so a single failed backing query can be
/// cloned out to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    InvalidReference(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    DuplicateUpload(String),

    #[error("unknown zip compression method for {name:?}")]
    UnsupportedCompression { name: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    HashMismatch(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        StoreError::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        StoreError::BadRequest(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            StoreError::InvalidReference(_) | StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::DuplicateUpload(_) => StatusCode::CONFLICT,
            StoreError::BadRequest(_) | StoreError::HashMismatch(_) => StatusCode::BAD_REQUEST,
            StoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            StoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            StoreError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            StoreError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::UnsupportedCompression { .. } | StoreError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable category, `None` for uncategorised internal errors
    pub fn code(&self) -> Option<&'static str> {
        match self {
            StoreError::InvalidReference(_) | StoreError::NotFound(_) => Some("not found"),
            StoreError::DuplicateUpload(_) => Some("duplicate upload"),
            StoreError::UnsupportedCompression { .. } => Some("unsupported compression"),
            StoreError::BadRequest(_) => Some("bad request"),
            StoreError::HashMismatch(_) => Some("hash mismatch"),
            StoreError::Unauthorized(_) => Some("unauthorized"),
            StoreError::Forbidden(_) => Some("forbidden"),
            StoreError::MethodNotAllowed(_) => Some("method not allowed"),
            StoreError::Timeout(_) => Some("timeout"),
            StoreError::Internal(_) => None,
        }
    }

    /// Message shown to clients. Reference grammar detail stays server-side.
    pub fn public_message(&self) -> String {
        match self {
            StoreError::InvalidReference(_) => "not found".to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON body of every error response, and of a failed facet inside `meta/any`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Code", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&StoreError> for ErrorEnvelope {
    fn from(err: &StoreError) -> Self {
        Self {
            message: err.public_message(),
            code: err.code().map(str::to_string),
        }
    }
}

/// Find the classified error anywhere in an anyhow chain
pub fn classify(err: &anyhow::Error) -> Option<&StoreError> {
    err.chain().find_map(|cause| cause.downcast_ref::<StoreError>())
}

/// Check if an error indicates "not found"
pub fn is_not_found_error(err: &anyhow::Error) -> bool {
    matches!(
        classify(err),
        Some(StoreError::NotFound(_)) | Some(StoreError::InvalidReference(_))
    )
}

/// Convert an arbitrary error into a `StoreError`, keeping its classification
pub fn to_store_error(err: &anyhow::Error) -> StoreError {
    match classify(err) {
        Some(e) => e.clone(),
        None => StoreError::Internal(format!("{:#}", err)),
    }
}
