//! Error types for the delegated auth core

use std::io;

use thiserror::Error;

use crate::auth::{ExchangeError, VerifyError};

/// Result type alias for the delegated auth core
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing trust anchor, bad credential settings).
    /// Fatal at startup, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bearer token verification failed
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// On-Behalf-Of exchange failed
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client construction error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the same request later.
    ///
    /// Only infrastructure faults qualify; verification and configuration
    /// failures are terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Verify(e) => e.is_retryable(),
            Self::Exchange(e) => e.is_retryable(),
            Self::Http(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}
