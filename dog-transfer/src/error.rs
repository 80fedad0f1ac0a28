use thiserror::Error;

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Result type for calls into an [`ObjectStore`](crate::ObjectStore)
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the transfer workflow
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Credential error: {message}")]
    Credential { message: String },

    #[error("Container already exists: {container}")]
    ContainerExists { container: String },

    #[error("Transient transfer error: {source}")]
    Transient {
        #[source]
        source: StoreError,
    },

    #[error("Transfer failed after {attempts} attempt(s): {reason}")]
    FatalTransfer { attempts: u32, reason: String },

    #[error("Commit failed for blob {blob}: {reason}")]
    Commit { blob: String, reason: String },

    #[error("Cleanup failed: {reason}")]
    Cleanup { reason: String },

    #[error("Transfer canceled")]
    Canceled,

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Storage backend error: {source}")]
    Store {
        #[source]
        source: StoreError,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl TransferError {
    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a credential error
    pub fn credential<S: Into<String>>(message: S) -> Self {
        Self::Credential {
            message: message.into(),
        }
    }

    /// Create a fatal transfer error
    pub fn fatal_transfer<S: Into<String>>(attempts: u32, reason: S) -> Self {
        Self::FatalTransfer {
            attempts,
            reason: reason.into(),
        }
    }

    /// Create a commit error
    pub fn commit<B: Into<String>, S: Into<String>>(blob: B, reason: S) -> Self {
        Self::Commit {
            blob: blob.into(),
            reason: reason.into(),
        }
    }

    /// Create a cleanup error
    pub fn cleanup<S: Into<String>>(reason: S) -> Self {
        Self::Cleanup {
            reason: reason.into(),
        }
    }

    /// Whether the workflow may carry on after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ContainerExists { .. } | Self::Cleanup { .. })
    }
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err.kind {
            StoreErrorKind::Credential => Self::Credential {
                message: err.message,
            },
            StoreErrorKind::Transient => Self::Transient { source: err },
            _ => Self::Store { source: err },
        }
    }
}

/// Classification attached to every store failure.
///
/// Callers switch on the kind; they never inspect the concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// The container (or object) being created already exists
    AlreadyExists,
    /// The container or blob does not exist, or is not yet committed
    NotFound,
    /// Expected to clear on retry: timeouts, dropped connections, throttling
    Transient,
    /// Rejected credentials
    Credential,
    /// Anything else; never retried
    Fatal,
}

impl std::fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AlreadyExists => "already exists",
            Self::NotFound => "not found",
            Self::Transient => "transient",
            Self::Credential => "credential",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Error returned by an object store call
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new<S: Into<String>>(kind: StoreErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn already_exists<S: Into<String>>(message: S) -> Self {
        Self::new(StoreErrorKind::AlreadyExists, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StoreErrorKind::NotFound, message)
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::new(StoreErrorKind::Transient, message)
    }

    pub fn credential<S: Into<String>>(message: S) -> Self {
        Self::new(StoreErrorKind::Credential, message)
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::new(StoreErrorKind::Fatal, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Transient
    }
}
