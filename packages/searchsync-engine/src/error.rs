use searchsync_storage::StorageError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid state transition for {entity_type}: {from} -> {to}")]
    InvalidStateTransition {
        entity_type: String,
        from: String,
        to: String,
    },

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("Backfill of {entity_type} failed: {reason}")]
    BackfillFailed { entity_type: String, reason: String },

    #[error("Cutover of alias {alias} failed: {reason}")]
    CutoverFailed { alias: String, reason: String },

    #[error("Handler {handler} failed on {source_type} change {token}: {reason}")]
    HandlerFailed {
        handler: String,
        source_type: String,
        token: String,
        reason: String,
    },

    #[error("Pipeline {0} halted")]
    PipelineHalted(String),

    #[error("Change source error: {0}")]
    ChangeSource(String),

    #[error("Lock {0} lost")]
    LockLost(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn change_source<E: std::fmt::Display>(e: E) -> Self {
        Self::ChangeSource(e.to_string())
    }

    pub fn backfill<E: std::fmt::Display>(entity_type: &str, e: E) -> Self {
        Self::BackfillFailed {
            entity_type: entity_type.to_string(),
            reason: e.to_string(),
        }
    }

    /// Classify for retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Storage(e) if e.is_transient() => ErrorCategory::Transient,
            SyncError::Storage(_) => ErrorCategory::Infrastructure,
            SyncError::Index(e) => e.category(),
            SyncError::ChangeSource(_) => ErrorCategory::Transient,
            SyncError::LockLost(_) | SyncError::Cancelled(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Errors raised by index store backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Alias {alias} resolves to {count} indices, expected exactly one")]
    AmbiguousAlias { alias: String, count: usize },

    #[error("Document {id} is malformed: {reason}")]
    MalformedDocument { id: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexError {
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            IndexError::Unavailable(_) => ErrorCategory::Transient,
            IndexError::Internal(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, connection)
    Transient,
    /// Permanent error - don't retry (e.g., invalid input, malformed document)
    Permanent,
    /// Infrastructure error - alert ops (e.g., disk full, lock lost)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
