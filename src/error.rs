//! Typed error hierarchy for armory-dl
//!
//! Every error carries enough context to decide how the engine reacts:
//! rotate to another mirror, fail the job, or stop the whole run.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download engine
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level errors (connect, read, TLS, HTTP status)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Protocol-level errors (bad Content-Range, malformed metadata)
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Filesystem errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Digest mismatch on a finished piece or a whole file
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    Verification { expected: String, actual: String },

    /// Invalid job setup (no mirrors, bad category, bad option value)
    #[error("Invalid configuration for '{field}': {message}")]
    Config {
        field: &'static str,
        message: String,
    },

    /// The run was cancelled
    #[error("Download aborted")]
    Aborted,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused
    ConnectionRefused,
    /// Connection reset mid-transfer
    ConnectionReset,
    /// Connect or read timeout
    Timeout,
    /// TLS/SSL error
    Tls,
    /// Server returned an error status
    HttpStatus(u16),
    /// Too many redirects
    TooManyRedirects,
    /// Body ended before the announced range/length
    Truncated,
    /// Other network error
    Other,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Invalid URL
    InvalidUrl,
    /// Content-Range does not cover the requested run
    RangeMismatch,
    /// Malformed HTTP response header
    InvalidResponse,
    /// Malformed search/metadata document
    InvalidMetadata,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Disk full
    DiskFull,
    /// Path escapes the download directory
    PathTraversal,
    /// Fewer bytes hit the disk than were handed to the writer
    ShortWrite,
    /// Other I/O error
    Io,
}

impl DownloadError {
    /// Whether the failure can be recovered by rotating to another mirror
    pub fn is_mirror_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Protocol { .. } | Self::Verification { .. }
        )
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout
                | NetworkErrorKind::ConnectionReset
                | NetworkErrorKind::ConnectionRefused
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a digest-mismatch error
    pub fn verification(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::Verification {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a configuration error
    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, DownloadError>;

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            ErrorKind::WriteZero => StorageErrorKind::ShortWrite,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::ConnectionRefused
        } else if err.is_redirect() {
            NetworkErrorKind::TooManyRedirects
        } else if let Some(status) = err.status() {
            NetworkErrorKind::HttpStatus(status.as_u16())
        } else {
            NetworkErrorKind::Other
        };

        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout | NetworkErrorKind::ConnectionRefused
        );

        Self::Network {
            kind,
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<url::ParseError> for DownloadError {
    fn from(err: url::ParseError) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::InvalidUrl,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::InvalidMetadata,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_recoverable_kinds() {
        assert!(DownloadError::network(NetworkErrorKind::Timeout, "t").is_mirror_recoverable());
        assert!(
            DownloadError::protocol(ProtocolErrorKind::RangeMismatch, "r").is_mirror_recoverable()
        );
        assert!(DownloadError::verification("aa", "bb").is_mirror_recoverable());
        assert!(
            !DownloadError::storage(StorageErrorKind::Io, "/tmp/x", "io").is_mirror_recoverable()
        );
        assert!(!DownloadError::config("mirrors", "empty").is_mirror_recoverable());
        assert!(!DownloadError::Aborted.is_mirror_recoverable());
    }

    #[test]
    fn io_error_kind_mapping() {
        let err: DownloadError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        match err {
            DownloadError::Storage { kind, .. } => assert_eq!(kind, StorageErrorKind::NotFound),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
