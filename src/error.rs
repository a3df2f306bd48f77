//! Error types for the detection engine.
//!
//! All errors are strongly typed using thiserror. Validation failures are
//! rejected before any state changes; execution failures describe what went
//! wrong while touching the stores; advisor failures are recoverable and never
//! abort a detection run.

use thiserror::Error;

use crate::application::ApplicationId;
use crate::conflict::ConflictId;
use crate::inconsistency::InconsistencyId;
use crate::policy::{PolicyId, PolicyStatus};
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' cannot be empty")]
    EmptyField {
        field: String,
    },

    #[error("A conflict cannot pair policy {id} with itself")]
    SelfConflict {
        id: PolicyId,
    },

    #[error("Cross-application conflict requires policies owned by different applications")]
    SameApplication,

    #[error("Inconsistent enforcement needs at least {min} {what}, got {actual}")]
    GroupTooSmall {
        what: &'static str,
        min: usize,
        actual: usize,
    },

    #[error("Application {application_id} owns none of the grouped policies")]
    OrphanApplication {
        application_id: ApplicationId,
    },

    #[error("Application {application_id} is not affected by this finding")]
    UnknownTarget {
        application_id: ApplicationId,
    },

    #[error("Resolution strategy '{strategy}' requires a unified policy definition")]
    MissingUnifiedPolicy {
        strategy: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while running detection or resolution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Policy not found: {id}")]
    PolicyNotFound {
        id: PolicyId,
    },

    #[error("Conflict not found: {id}")]
    ConflictNotFound {
        id: ConflictId,
    },

    #[error("Inconsistent enforcement not found: {id}")]
    InconsistencyNotFound {
        id: InconsistencyId,
    },

    #[error("Invalid transition for {kind} {id}: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Concurrent resolution on {target}: {reason}")]
    ConcurrentResolutionConflict {
        target: String,
        reason: String,
    },

    /// The policy was retired by an earlier resolution; retrying cannot help.
    #[error("Policy {id} is already {status} and cannot be replaced")]
    PolicyRetired {
        id: PolicyId,
        status: PolicyStatus,
    },

    #[error("Unified policy applied to {} application(s), failed for {}", applied.len(), failed.len())]
    PartialApplyFailure {
        applied: Vec<ApplicationId>,
        failed: Vec<ApplicationId>,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Worker pool failure: {message}")]
    Worker {
        message: String,
    },

    #[error("Detection run cancelled")]
    Cancelled,
}

/// Errors from the external recommendation service boundary.
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("Recommendation service timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Recommendation service unavailable: {reason}")]
    Unavailable {
        reason: String,
    },

    #[error("Recommendation service returned an unusable response: {reason}")]
    InvalidResponse {
        reason: String,
    },
}

/// Top-level error type for the engine.
#[derive(Debug, Error)]
pub enum AccordError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Advisor error: {0}")]
    Advisor(#[from] AdvisorError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl AccordError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the request was rejected because of an invalid state transition.
    #[must_use]
    pub const fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::InvalidTransition { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::ConcurrentResolutionConflict { .. }
                    | ExecutionError::PartialApplyFailure { .. }
            ),
            Self::Advisor(e) => matches!(e, AdvisorError::Timeout { .. } | AdvisorError::Unavailable { .. }),
        }
    }
}

impl From<StorageError> for ExecutionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::PolicyNotFound(id) => Self::PolicyNotFound { id },
            StorageError::ConflictNotFound(id) => Self::ConflictNotFound { id },
            StorageError::InconsistencyNotFound(id) => Self::InconsistencyNotFound { id },
            StorageError::VersionConflict { ref key, .. } => Self::ConcurrentResolutionConflict {
                target: key.clone(),
                reason: err.to_string(),
            },
            other => Self::Storage {
                message: other.to_string(),
            },
        }
    }
}

impl From<StorageError> for AccordError {
    fn from(err: StorageError) -> Self {
        Self::Execution(err.into())
    }
}

/// Result type alias for engine operations.
pub type AccordResult<T> = Result<T, AccordError>;
