//! Centralized error types for mboxmigrate.
//!
//! Errors are layered by blast radius. [`EncodingError`] and [`PartError`]
//! are absorbed inside the stage that produces them; [`DecodeError`] and
//! [`SinkError`] cost one message; [`FatalError`] ends the run.

use std::path::PathBuf;
use thiserror::Error;

/// A header value could not be decoded with its declared charset.
///
/// Field-level: the normalizer falls back to best-effort text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The encoded-word payload is not valid base64 / Q-encoding.
    #[error("Malformed encoded-word payload: {0}")]
    MalformedPayload(String),

    /// The bytes are not valid in the declared charset.
    #[error("Bytes are not valid {charset}")]
    InvalidCharset { charset: String },
}

/// A span cannot be split into a header block and a body.
///
/// Message-level: the orchestrator skips the message and counts it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The span holds no bytes (or only whitespace).
    #[error("Empty message")]
    Empty,

    /// No `Name: value` line could be found before the body.
    #[error("No header block found")]
    NoHeaders,
}

/// One MIME leaf failed to decode.
///
/// Part-level: the classifier omits the leaf and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartError {
    /// The declared Content-Transfer-Encoding is not one we can decode.
    #[error("Unsupported transfer encoding '{0}'")]
    UnsupportedEncoding(String),

    /// The base64 payload is corrupt or truncated.
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),

    /// The Content-Type value has no usable `type/subtype`.
    #[error("Invalid content type: {0}")]
    InvalidContentType(String),
}

/// The destination rejected an operation.
#[derive(Error, Debug)]
pub enum SinkError {
    /// This message was refused; later messages may still succeed.
    #[error("Destination rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    /// The destination is not usable at all.
    #[error("Destination unavailable: {0}")]
    Unavailable(String),

    /// Filesystem error inside a file-backed destination.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SinkError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means no further message can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Conditions that abort the whole run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// The failed-message counter went over the configured threshold.
    #[error("Too many errors ({count}), stopping")]
    TooManyErrors { count: u64 },

    /// The destination reported itself unusable.
    #[error("Destination unavailable: {0}")]
    SinkUnavailable(String),
}

/// Why a single message was marked failed.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Structural error: {0}")]
    Structural(#[from] DecodeError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// All errors surfaced by the mboxmigrate library.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// I/O error with the associated file path.
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The specified file does not exist.
    #[error("MBOX file not found: {0}")]
    FileNotFound(PathBuf),

    /// The checkpoint file exists but cannot be used.
    #[error("Corrupt checkpoint '{path}': {reason}")]
    Checkpoint { path: PathBuf, reason: String },
}

/// Convenience alias for `Result<T, MigrateError>`.
pub type Result<T> = std::result::Result<T, MigrateError>;

impl MigrateError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (streams handed in by the caller).
impl From<std::io::Error> for MigrateError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<stream>"),
            source,
        }
    }
}
