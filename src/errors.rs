//! Typed error hierarchy for the flow engine.
//!
//! `FlowError` carries the stable error kinds surfaced to callers:
//! validation, conflict, transient and permanent storage, upstream, timeout.
//! Policy denials are not errors; they travel as
//! [`ApplyOutcome::Denied`](crate::flow::engine::ApplyOutcome).

use flow_common::{WorkItemId, models::ParseEnumError};
use rusqlite::ErrorCode;
use thiserror::Error;

/// Stable error kind names, as exposed in API error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    PolicyDenial,
    Conflict,
    TransientStorage,
    PermanentStorage,
    Upstream,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::PolicyDenial => "policy_denial",
            Self::Conflict => "conflict",
            Self::TransientStorage => "transient_storage",
            Self::PermanentStorage => "permanent_storage",
            Self::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Work item {id} not found")]
    WorkItemNotFound { id: WorkItemId },

    #[error("Stage '{name}' not found")]
    StageNotFound { name: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient storage error: {0:#}")]
    TransientStorage(#[source] anyhow::Error),

    #[error("Storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("Deadline exceeded while {0}")]
    DeadlineExceeded(&'static str),

    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl FlowError {
    /// Classify a storage-layer error. SQLite busy/locked codes anywhere in
    /// the chain are transient; everything else is permanent.
    pub fn from_storage(err: anyhow::Error) -> Self {
        let transient = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<rusqlite::Error>(),
                Some(rusqlite::Error::SqliteFailure(e, _))
                    if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            )
        });
        if transient {
            Self::TransientStorage(err)
        } else {
            Self::Storage(err)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WorkItemNotFound { .. } | Self::StageNotFound { .. } | Self::Validation(_) => {
                ErrorKind::Validation
            }
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::TransientStorage(_) | Self::DeadlineExceeded(_) => ErrorKind::TransientStorage,
            Self::Storage(_) => ErrorKind::PermanentStorage,
            Self::Upstream(_) => ErrorKind::Upstream,
        }
    }

    /// Whether a caller may retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientStorage
    }
}

impl From<ParseEnumError> for FlowError {
    fn from(err: ParseEnumError) -> Self {
        Self::Validation(err.to_string())
    }
}
