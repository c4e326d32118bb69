//! Error types for sniffstat operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while classifying captures or aggregating statistics.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on a specific path.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A temporary file could not be moved into place.
    #[error("failed to persist {path}: {source}")]
    Persist {
        /// Final destination.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: tempfile::PersistError,
    },

    /// Config file or rendering feed (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Capture file name does not follow `<group>-<YYYYMMDD>-<HHMM>`.
    #[error("unable to understand file name {0}")]
    InvalidFileName(String),

    /// A file name pattern failed to compile.
    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    /// Statistics directory is not an 8-digit date.
    #[error("invalid date directory: {0}")]
    InvalidDateDir(String),

    /// Reading a capture file failed.
    #[cfg(feature = "capture")]
    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    /// Capture reading is not compiled in.
    #[error("built without capture support (enable the `capture` feature)")]
    CaptureUnsupported,

    /// The run was interrupted between files.
    #[error("interrupted")]
    Cancelled,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_path() {
        let err = Error::io(
            "/tmp/stats/20130501",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/stats/20130501"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_invalid_file_name_display() {
        let err = Error::InvalidFileName("capture.pcap".into());
        assert!(err.to_string().contains("capture.pcap"));
    }
}
