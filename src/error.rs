//! Error types for tidal-dl
//!
//! This module provides the error taxonomy of the acquisition pipeline:
//! - Stage-specific failures (resolve, fetch, decrypt, transcode)
//! - A serialisable [`ErrorKind`] used in per-item results and JSON summaries
//! - Classification helpers used by the orchestrator (fresh manifest, fatal)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tidal-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tidal-dl
///
/// Each variant carries enough context to be reported against the item that
/// produced it without access to the original request.
#[derive(Debug, Error)]
pub enum Error {
    /// The item does not exist at the requested quality
    #[error("not available: {item} at {quality}")]
    NotAvailable {
        /// Item descriptor, rendered as `kind/id`
        item: String,
        /// Requested quality tier
        quality: String,
    },

    /// Credentials are missing, invalid or expired
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 5xx responses, timeouts and other transient service conditions
    #[error("transient service error: {0}")]
    TransientService(String),

    /// A segment could not be fetched within its retry budget
    #[error("segment {segment} failed after {attempts} attempts: {reason}")]
    FetchExhausted {
        /// Index of the failing segment within the manifest
        segment: usize,
        /// Number of attempts made, including the first
        attempts: u32,
        /// Last error observed for the segment
        reason: String,
    },

    /// Decrypted output failed a container-level sanity check
    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),

    /// The container or codec cannot be handled by the transcoder
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The transcoder ran but did not produce usable output
    #[error("transcode failed: {0}")]
    TranscodeFailure(String),

    /// The task was cancelled cooperatively
    #[error("cancelled")]
    Cancelled,

    /// Shutdown in progress - not accepting new items
    #[error("shutdown in progress: not accepting new items")]
    ShuttingDown,

    /// The destination filesystem rejected a write; aborts the whole run
    #[error("destination {path} is not writable: {source}")]
    DestinationUnwritable {
        /// Path that could not be created or written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Playback info or playlist could not be turned into a manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// An identifier string could not be parsed into an item descriptor
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "fetch.part_size")
        key: Option<String>,
    },

    /// External tool execution failed (ffmpeg)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Task not found
    #[error("task not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Machine-readable error classification reported with failed items
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::NotAvailable`]
    NotAvailable,
    /// See [`Error::Unauthorized`]
    Unauthorized,
    /// See [`Error::TransientService`]
    TransientServiceError,
    /// See [`Error::FetchExhausted`]
    FetchExhausted,
    /// See [`Error::IntegrityFailure`]
    IntegrityFailure,
    /// See [`Error::UnsupportedFormat`]
    UnsupportedFormat,
    /// See [`Error::TranscodeFailure`]
    TranscodeFailure,
    /// Cancelled or shut down
    Cancelled,
    /// Destination filesystem problems, including fatal ones
    Filesystem,
    /// Malformed manifests, identifiers or configuration
    InvalidInput,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotAvailable => "not_available",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::TransientServiceError => "transient_service_error",
            ErrorKind::FetchExhausted => "fetch_exhausted",
            ErrorKind::IntegrityFailure => "integrity_failure",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::TranscodeFailure => "transcode_failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Filesystem => "filesystem",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classify this error for reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotAvailable { .. } => ErrorKind::NotAvailable,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::TransientService(_) | Error::Network(_) => ErrorKind::TransientServiceError,
            Error::FetchExhausted { .. } => ErrorKind::FetchExhausted,
            Error::IntegrityFailure(_) => ErrorKind::IntegrityFailure,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::TranscodeFailure(_) | Error::ExternalTool(_) => ErrorKind::TranscodeFailure,
            Error::Cancelled | Error::ShuttingDown => ErrorKind::Cancelled,
            Error::DestinationUnwritable { .. } | Error::Io(_) => ErrorKind::Filesystem,
            Error::InvalidManifest(_)
            | Error::InvalidIdentifier(_)
            | Error::Config { .. }
            | Error::Serialization(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying requires a freshly resolved manifest
    ///
    /// Signed segment URLs expire and a wrong key reproduces the same bytes, so
    /// these failures are never retried against the manifest that caused them.
    pub fn needs_fresh_manifest(&self) -> bool {
        matches!(
            self,
            Error::FetchExhausted { .. } | Error::IntegrityFailure(_)
        )
    }

    /// Whether this error aborts the whole run rather than a single item
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DestinationUnwritable { .. })
    }

    /// Wrap an I/O error raised while writing to `path`
    ///
    /// Permission and read-only failures are promoted to
    /// [`Error::DestinationUnwritable`]; everything else stays an item-level
    /// [`Error::Io`].
    pub fn from_destination_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::ReadOnlyFilesystem => {
                Error::DestinationUnwritable {
                    path: path.into(),
                    source,
                }
            }
            _ => Error::Io(source),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_pipeline_taxonomy() {
        let not_available = Error::NotAvailable {
            item: "track/1".into(),
            quality: "max".into(),
        };
        assert_eq!(not_available.kind(), ErrorKind::NotAvailable);
        assert_eq!(
            Error::Unauthorized("expired".into()).kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            Error::TransientService("503".into()).kind(),
            ErrorKind::TransientServiceError
        );
        assert_eq!(
            Error::FetchExhausted {
                segment: 2,
                attempts: 4,
                reason: "timeout".into()
            }
            .kind(),
            ErrorKind::FetchExhausted
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn fresh_manifest_only_for_fetch_and_integrity() {
        assert!(
            Error::FetchExhausted {
                segment: 0,
                attempts: 1,
                reason: "403".into()
            }
            .needs_fresh_manifest()
        );
        assert!(Error::IntegrityFailure("bad magic".into()).needs_fresh_manifest());
        assert!(!Error::TranscodeFailure("ffmpeg".into()).needs_fresh_manifest());
        assert!(!Error::Unauthorized("nope".into()).needs_fresh_manifest());
    }

    #[test]
    fn permission_denied_on_destination_is_fatal() {
        let err = Error::from_destination_io(
            "/music/a.flac",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::Filesystem);

        let err = Error::from_destination_io(
            "/music/a.flac",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn fetch_exhausted_message_names_segment() {
        let err = Error::FetchExhausted {
            segment: 7,
            attempts: 4,
            reason: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "segment 7 failed after 4 attempts: connection reset"
        );
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::TransientServiceError).unwrap();
        assert_eq!(json, "\"transient_service_error\"");
        assert_eq!(ErrorKind::FetchExhausted.to_string(), "fetch_exhausted");
    }
}
