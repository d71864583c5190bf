//! Error types for emailit-relay.

use std::io;
use thiserror::Error;

/// Main error type for storage, configuration and setup operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O errors (file operations, listeners)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// `SQLite` database errors
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// JSON encoding or decoding errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// HTTP client construction errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
    /// A blocking storage task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// Fallback (SMTP) delivery errors
    #[error("fallback delivery error: {0}")]
    Fallback(String),
}

/// Why a single send through the vendor API did not succeed.
///
/// The `Display` text is what ends up in the `response` column of a failed
/// log record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No API key stored in the settings
    #[error("API key is not configured")]
    ApiKeyMissing,
    /// One of `from`, `to` or `subject` is empty
    #[error("the \"{0}\" field is required")]
    MissingField(&'static str),
    /// Neither an HTML nor a plain-text body
    #[error("the email must have HTML or plain-text content")]
    MissingContent,
    /// Sender address failed the syntax check
    #[error("the sender address is not valid")]
    InvalidFrom,
    /// Recipient address failed the syntax check
    #[error("the recipient address is not valid")]
    InvalidTo,
    /// Test connection requested without a configured sender
    #[error("configure the sender email first")]
    SenderNotConfigured,
    /// DNS, TLS, timeout and other connection-level failures
    #[error("{0}")]
    Transport(String),
    /// Non-2xx answer from the vendor
    #[error("{message}")]
    Api { status: u16, message: String },
}

impl SendError {
    /// Stable machine-readable code for this failure kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ApiKeyMissing => "api_key_missing",
            Self::MissingField(_) => "missing_field",
            Self::MissingContent => "missing_content",
            Self::InvalidFrom => "invalid_from",
            Self::InvalidTo => "invalid_to",
            Self::SenderNotConfigured => "missing_from",
            Self::Transport(_) => "transport_error",
            Self::Api { .. } => "api_error",
        }
    }

    /// True when the failure was detected locally, before any network I/O.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        !matches!(self, Self::Transport(_) | Self::Api { .. })
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io_err) => io_err,
            other => Self::other(other.to_string()),
        }
    }
}

/// Result type alias for emailit-relay operations.
pub type Result<T> = std::result::Result<T, Error>;
