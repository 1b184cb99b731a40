#![forbid(unsafe_code)]

//! Error taxonomy shared by the resolver, orchestrator and packager.
//!
//! Every variant carries a human readable message that ends up verbatim in the
//! JSON error envelope, so keep them short and free of filesystem paths.

use axum::http::StatusCode;
use thiserror::Error;

pub type PlaylistResult<T> = Result<T, PlaylistError>;

#[derive(Debug, Error)]
pub enum PlaylistError {
    /// Missing or malformed request input.
    #[error("{0}")]
    Validation(String),

    /// Playlist metadata lookup failed or produced nothing usable.
    #[error("{message}")]
    Resolution { message: String, no_entries: bool },

    /// The external downloader failed for the whole job.
    #[error("{0}")]
    Download(String),

    /// Nothing left on disk to hand back to the client.
    #[error("{0}")]
    Packaging(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlaylistError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
            no_entries: false,
        }
    }

    pub fn no_entries() -> Self {
        Self::Resolution {
            message: "No entries found in playlist".to_string(),
            no_entries: true,
        }
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::Download(message.into())
    }

    pub fn packaging(message: impl Into<String>) -> Self {
        Self::Packaging(message.into())
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Status code used when the error crosses the HTTP boundary.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Resolution {
                no_entries: true, ..
            } => StatusCode::NOT_FOUND,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Resolution { .. } | Self::Download(_) | Self::Packaging(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
