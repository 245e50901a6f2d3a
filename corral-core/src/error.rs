//! Error types for Corral
//!
//! Every fallible operation returns [`Result`]. Callers branch on
//! [`Error::kind`], never on the concrete variant.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Category of a failure, independent of where it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Referenced container, resource, or event does not exist
    NotFound,
    /// Duplicate creation
    AlreadyExists,
    /// Malformed spec, out-of-range limit, or unrecognized event
    InvalidArgument,
    /// Backend rejected the operation for the caller
    PermissionDenied,
    /// Backend or kernel failure
    Internal,
    /// Transient backend failure, safe to retry
    Unavailable,
    /// Pending notification cancelled by handler teardown
    Cancelled,
}

impl ErrorKind {
    /// Map an errno value onto a kind
    #[must_use]
    pub const fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT | libc::ESRCH | libc::ENODEV => Self::NotFound,
            libc::EEXIST => Self::AlreadyExists,
            libc::EINVAL | libc::ERANGE => Self::InvalidArgument,
            libc::EPERM | libc::EACCES => Self::PermissionDenied,
            libc::EBUSY | libc::ENOTEMPTY | libc::EAGAIN | libc::EINTR => Self::Unavailable,
            _ => Self::Internal,
        }
    }

    fn from_io(err: &std::io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Self::from_errno(errno);
        }

        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                Self::InvalidArgument
            }
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => Self::Unavailable,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// One failed sub-item of a multi-item operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// The field or identifier that failed
    pub item: String,
    /// Kind of the failure
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl ItemFailure {
    /// Record `error` as the failure of `item`
    #[must_use]
    pub fn new(item: impl Into<String>, error: &Error) -> Self {
        Self {
            item: item.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.item, self.kind, self.message)
    }
}

/// Corral error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Referenced object does not exist
    #[error("Not found: {message}")]
    NotFound {
        /// Error message
        message: String,
    },

    /// Object already exists
    #[error("Already exists: {message}")]
    AlreadyExists {
        /// Error message
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// Permission denied
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// Operation that was denied
        operation: String,
    },

    /// `CGroup` operation failed
    #[error("CGroup error: {message}")]
    CGroup {
        /// Error message
        message: String,
    },

    /// Backend is busy or temporarily unable to serve the request
    #[error("Unavailable: {message}")]
    Unavailable {
        /// Error message
        message: String,
    },

    /// Operation was cancelled
    #[error("Cancelled: {message}")]
    Cancelled {
        /// Error message
        message: String,
    },

    /// Some sub-items of the operation failed
    #[error("{} item(s) failed: {}", .failures.len(), join_failures(.failures))]
    Partial {
        /// Kind of the first failure
        kind: ErrorKind,
        /// Every failed item, in the order attempted
        failures: Vec<ItemFailure>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// Task join error
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

fn join_failures(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Shorthand for [`Error::NotFound`]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::AlreadyExists`]
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::InvalidConfig`]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Unavailable`]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Cancelled`]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Wrap an I/O failure of `operation`, keeping its kind
    pub fn from_io(operation: impl fmt::Display, err: &std::io::Error) -> Self {
        let message = format!("{operation}: {err}");
        match ErrorKind::from_io(err) {
            ErrorKind::NotFound => Self::NotFound { message },
            ErrorKind::AlreadyExists => Self::AlreadyExists { message },
            ErrorKind::InvalidArgument => Self::InvalidConfig { message },
            ErrorKind::PermissionDenied => Self::PermissionDenied { operation: message },
            ErrorKind::Unavailable => Self::Unavailable { message },
            ErrorKind::Cancelled => Self::Cancelled { message },
            ErrorKind::Internal => Self::CGroup { message },
        }
    }

    /// Collapse per-item failures into a single error
    ///
    /// Returns `None` when nothing failed.
    #[must_use]
    pub fn partial(failures: Vec<ItemFailure>) -> Option<Self> {
        let kind = failures.first()?.kind;
        Some(Self::Partial { kind, failures })
    }

    /// Category of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::InvalidConfig { .. } => ErrorKind::InvalidArgument,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::CGroup { .. } | Self::TaskJoin(_) => ErrorKind::Internal,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Partial { kind, .. } => *kind,
            Self::Io(e) => ErrorKind::from_io(e),
            Self::System(errno) => ErrorKind::from_errno(*errno as i32),
        }
    }

    /// Per-item failures, empty unless this is [`Error::Partial`]
    #[must_use]
    pub fn failures(&self) -> &[ItemFailure] {
        match self {
            Self::Partial { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Result type alias for Corral operations
pub type Result<T> = std::result::Result<T, Error>;
