//! Error types for AmbientDB core.

use crate::types::{ContextKind, EntityKey, IsolationLevel, PendingCounts};
use std::fmt;
use thiserror::Error;

/// Result type for unit-of-work operations.
pub type UowResult<T> = Result<T, UowError>;

/// A single validation failure reported by a context during persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Entity the failure was reported for.
    pub entity: EntityKey,
    /// Field (property) that failed validation.
    pub field: String,
    /// Human-readable reason.
    pub message: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.entity, self.field, self.message)
    }
}

/// Errors that can occur in AmbientDB unit-of-work operations.
#[derive(Debug, Error)]
pub enum UowError {
    /// A write scope was requested while the ambient scope is read-only.
    #[error("cannot nest a write scope under a read-only ambient scope ({kind})")]
    ReadWriteEscalation {
        /// Kind of the ambient context.
        kind: ContextKind,
    },

    /// A child scope tried to change the isolation level of an
    /// established ambient transaction.
    #[error("cannot change isolation level on an ambient transaction (requested {requested}, ambient {ambient:?})")]
    IsolationOverride {
        /// Level the child requested.
        requested: IsolationLevel,
        /// Level the ambient transaction was established with, if any.
        ambient: Option<IsolationLevel>,
    },

    /// A persistence call bypassed the resource set's save path.
    #[error("cannot persist directly on context {kind}; use the owning scope's save path")]
    DirectSave {
        /// Kind of the context the call was made on.
        kind: ContextKind,
    },

    /// A read-only context holds pending changes at save time.
    #[error("cannot modify entities on a read-only context {kind} ({pending})")]
    ReadOnlyDirty {
        /// Kind of the offending context.
        kind: ContextKind,
        /// What was pending.
        pending: PendingCounts,
    },

    /// Persistence was rejected due to constraint or field violations.
    #[error("validation failed for {} entit{}", failures.len(), if failures.len() == 1 { "y" } else { "ies" })]
    Validation {
        /// Per-entity, per-field detail.
        failures: Vec<ValidationFailure>,
    },

    /// The registry's current set disagrees with what a scope believes
    /// it owns. Symptomatic of a chain-identity propagation bug; fatal,
    /// never retried.
    #[error("consistency violation: {message}")]
    ConsistencyViolation {
        /// Description of the mismatch.
        message: String,
    },

    /// Operation on a scope whose resource set is already disposed.
    #[error("resource set already disposed")]
    Disposed,

    /// A context of this kind already exists in the resource set.
    #[error("context {kind} already exists in this resource set")]
    DuplicateContext {
        /// The duplicated kind.
        kind: ContextKind,
    },

    /// No context of this kind is known (not registered, or not in the set).
    #[error("no context of kind {kind} is available")]
    UnknownContext {
        /// The missing kind.
        kind: ContextKind,
    },

    /// No ambient scope is open on this call chain.
    #[error("no ambient scope is open on this call chain")]
    NoAmbientScope,

    /// An asynchronous save was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying store reported a failure.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

impl UowError {
    /// Creates a consistency violation error.
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            message: message.into(),
        }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a validation error from collected failures.
    #[must_use]
    pub fn validation(failures: Vec<ValidationFailure>) -> Self {
        Self::Validation { failures }
    }

    /// Creates a direct-save guard error.
    #[must_use]
    pub fn direct_save(kind: ContextKind) -> Self {
        Self::DirectSave { kind }
    }

    /// True for errors that indicate a programming bug rather than a
    /// recoverable condition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConsistencyViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn validation_display_counts_entities() {
        let failure = ValidationFailure {
            entity: EntityKey::new("posts", Uuid::nil()),
            field: "title".to_string(),
            message: "must not be empty".to_string(),
        };
        let err = UowError::validation(vec![failure.clone(), failure]);
        assert!(format!("{err}").contains("2 entities"));
    }

    #[test]
    fn consistency_is_fatal() {
        assert!(UowError::consistency("duplicate set").is_fatal());
        assert!(!UowError::Disposed.is_fatal());
    }
}
