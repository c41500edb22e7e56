//! Error types for the Ratewell crate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Ratewell operations.
///
/// Rate limit checks never surface these to callers; they are produced by
/// configuration loading and by the remote counter store, whose failures the
/// limiter absorbs.
#[derive(Error, Debug)]
pub enum RatewellError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote counter store errors
    #[error("Remote store error: {0}")]
    Remote(#[from] redis::RedisError),

    /// Remote counter store did not answer in time
    #[error("Remote store timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewell operations.
pub type Result<T> = std::result::Result<T, RatewellError>;
