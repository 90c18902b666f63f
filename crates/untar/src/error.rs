//! Error and warning types for the extraction engine.
//!
//! Failures split into two severities.  A fatal error ([`UnpackError`])
//! terminates the whole extraction: the extraction root is unusable, the
//! archive itself cannot be parsed, or strict mode promoted a warning.
//! Everything else is per-entry: the entry is reported as a [`Warning`],
//! its payload is drained, and the rest of the archive proceeds.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for extraction operations.
pub type Result<T> = std::result::Result<T, UnpackError>;

/// Errors that terminate an extraction.
#[derive(Debug, Error)]
pub enum UnpackError {
    /// The extraction root is missing or not a directory.
    #[error("extraction root {path:?} is not a usable directory: {source}")]
    Cwd {
        /// The configured extraction root.
        path: PathBuf,
        /// The underlying observation.
        source: std::io::Error,
    },

    /// A symbolic link was found in the ancestor chain of a target path.
    #[error("symbolic link in directory chain: {path:?}")]
    Symlink {
        /// The offending ancestor.
        path: PathBuf,
    },

    /// The option set is self-contradictory.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The archive stream is malformed or ended unexpectedly.
    #[error("unrecoverable archive error: {0}")]
    BadArchive(#[source] std::io::Error),

    /// A filesystem operation on one entry failed.
    ///
    /// Only surfaced as an error in strict mode; otherwise entry failures
    /// become warnings.
    #[error("failed to process {path:?}: {source}")]
    Entry {
        /// The entry's resolved target path.
        path: PathBuf,
        /// The failing operation.
        source: std::io::Error,
    },

    /// A warning promoted to an error by strict mode.
    #[error("{0}")]
    Strict(Warning),

    /// I/O error outside any particular entry.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of a non-fatal diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnCode {
    /// An entry was rejected or failed and was skipped.
    EntryError,
    /// An entry was adjusted (e.g. absolute prefix stripped) but extracted.
    EntryInfo,
    /// An entry kind this engine does not materialize (device, fifo).
    EntryUnsupported,
    /// The upstream parser reported a malformed archive.
    BadArchive,
    /// The upstream parser aborted.
    Abort,
}

impl WarnCode {
    /// The stable string form used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            WarnCode::EntryError => "ENTRY_ERROR",
            WarnCode::EntryInfo => "ENTRY_INFO",
            WarnCode::EntryUnsupported => "ENTRY_UNSUPPORTED",
            WarnCode::BadArchive => "BAD_ARCHIVE",
            WarnCode::Abort => "ABORT",
        }
    }

    /// Whether the extraction can continue past a warning with this code.
    pub fn recoverable(self) -> bool {
        !matches!(self, WarnCode::BadArchive | WarnCode::Abort)
    }
}

impl fmt::Display for WarnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal diagnostic attached to one archive entry.
#[derive(Debug, Clone)]
pub struct Warning {
    /// Diagnostic class.
    pub code: WarnCode,
    /// Human-readable description.
    pub message: String,
    /// The archive path the diagnostic refers to, when there is one.
    pub path: Option<PathBuf>,
}

impl Warning {
    pub fn new(code: WarnCode, message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            code,
            message: message.into(),
            path,
        }
    }

    /// Whether the extraction can continue past this warning.
    pub fn recoverable(&self) -> bool {
        self.code.recoverable()
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {} ({})", self.code, self.message, path.display()),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}
