//! Error kinds shared across the sync engine, scheduler, and auth driver.

use thiserror::Error;

/// The error surface every collaborator in this crate propagates.
///
/// Variant names match the error *kinds* in the design doc, not HTTP
/// status codes — `http_status_hint` maps a handful of them back for
/// logging, but callers should match on the variant, not a number.
#[derive(Debug, Error)]
pub enum MxError {
    #[error("local timeout after {0:?}")]
    LocalTimeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] anyhow::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("{errcode}: {message}")]
    Matrix {
        errcode: String,
        message: String,
        http_status: u16,
    },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("access token no longer valid")]
    UnknownToken,

    #[error("no incomplete authentication flows were advertised")]
    NoIncompleteFlows,

    #[error("gave up after exhausting retries: {0}")]
    GaveUp(Box<MxError>),
}

impl MxError {
    /// Build a `Matrix` variant from a parsed `{errcode, error}` body, upgrading to
    /// `RateLimited` or `UnknownToken` when the errcode carries those semantics.
    pub fn from_matrix_body(http_status: u16, errcode: String, message: String, retry_after_ms: Option<u64>) -> Self {
        if let Some(retry_after_ms) = retry_after_ms {
            if errcode == "M_LIMIT_EXCEEDED" {
                return MxError::RateLimited { retry_after_ms };
            }
        }
        if errcode == "M_UNKNOWN_TOKEN" {
            return MxError::UnknownToken;
        }
        MxError::Matrix {
            errcode,
            message,
            http_status,
        }
    }

    /// `true` for errors the request scheduler should sleep-and-retry on rather
    /// than surface immediately.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, MxError::RateLimited { .. })
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            MxError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MxError>;
