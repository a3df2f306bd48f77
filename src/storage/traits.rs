//! Abstract storage traits.
//!
//! The engine reaches its state only through these traits, so the same
//! detection and resolution code runs over the in-memory backend in tests
//! and over a database-backed implementation in production.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::{Application, ApplicationId};
use crate::conflict::{Conflict, ConflictId, ConflictScope, ConflictStatus, ConflictType, PairKey};
use crate::inconsistency::{InconsistencyId, InconsistencyStatus, InconsistentEnforcement};
use crate::policy::{Policy, PolicyId};
use crate::severity::Severity;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Policy not found: {0}")]
    PolicyNotFound(PolicyId),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("Inconsistent enforcement not found: {0}")]
    InconsistencyNotFound(InconsistencyId),

    /// Key already exists, or a pending conflict already covers the pair.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Optimistic concurrency check failed.
    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The backend refused the write.
    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// Filter for listing conflicts. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFilter {
    pub status: Option<ConflictStatus>,
    pub severity: Option<Severity>,
    pub scope: Option<ConflictScope>,
    pub conflict_type: Option<ConflictType>,
    pub resource_type: Option<String>,
    pub policy_id: Option<PolicyId>,
}

impl ConflictFilter {
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: Some(ConflictStatus::Pending),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: ConflictScope) -> Self {
        self.scope = Some(scope);
        self
    }

    #[must_use]
    pub fn with_type(mut self, conflict_type: ConflictType) -> Self {
        self.conflict_type = Some(conflict_type);
        self
    }

    #[must_use]
    pub fn matches(&self, conflict: &Conflict) -> bool {
        self.status.map_or(true, |s| conflict.status == s)
            && self.severity.map_or(true, |s| conflict.severity == s)
            && self.scope.map_or(true, |s| conflict.scope == s)
            && self.conflict_type.map_or(true, |t| conflict.conflict_type == t)
            && self
                .resource_type
                .as_ref()
                .map_or(true, |r| &conflict.resource_type == r)
            && self.policy_id.map_or(true, |id| conflict.pair_key().contains(id))
    }
}

/// Filter for listing inconsistent-enforcement findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistencyFilter {
    pub status: Option<InconsistencyStatus>,
    pub severity: Option<Severity>,
    pub resource_type: Option<String>,
    pub application_id: Option<ApplicationId>,
}

impl InconsistencyFilter {
    #[must_use]
    pub fn with_status(mut self, status: InconsistencyStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    #[must_use]
    pub fn matches(&self, finding: &InconsistentEnforcement) -> bool {
        self.status.map_or(true, |s| finding.status == s)
            && self.severity.map_or(true, |s| finding.severity == s)
            && self
                .resource_type
                .as_ref()
                .map_or(true, |r| &finding.resource_type == r)
            && self
                .application_id
                .as_ref()
                .map_or(true, |a| finding.affected_application_ids.contains(a))
    }
}

/// Storage trait for policies.
///
/// Policies are written by external scanners; the engine only supersedes
/// them and inserts unified replacements.
pub trait PolicyStore: Send + Sync {
    /// Insert a new policy. Returns error if ID already exists.
    fn insert(&self, policy: Policy) -> Result<(), StorageError>;

    fn get(&self, id: PolicyId) -> Result<Option<Policy>, StorageError>;

    /// All policies owned by the given applications, or every policy when
    /// `applications` is `None`. Includes inactive policies.
    fn list_in_scope(&self, applications: Option<&BTreeSet<ApplicationId>>) -> Result<Vec<Policy>, StorageError>;

    /// Marks a policy superseded if its version still equals `expected_version`.
    ///
    /// # Errors
    /// - `PolicyNotFound` if the policy does not exist
    /// - `VersionConflict` if the policy changed since it was read
    fn supersede(
        &self,
        id: PolicyId,
        expected_version: u64,
        superseded_by: Option<PolicyId>,
    ) -> Result<Policy, StorageError>;

    /// Marks a policy inactive under the same version check as `supersede`.
    fn deactivate(&self, id: PolicyId, expected_version: u64) -> Result<Policy, StorageError>;

    /// Returns a superseded or inactive policy to active and clears
    /// `superseded_by`, under the same version check. Used to undo a
    /// resolution step that could not complete.
    fn reactivate(&self, id: PolicyId, expected_version: u64) -> Result<Policy, StorageError>;
}

/// Storage trait for applications.
pub trait ApplicationStore: Send + Sync {
    /// Inserts or replaces an application.
    fn upsert(&self, application: Application) -> Result<(), StorageError>;

    fn get(&self, id: &ApplicationId) -> Result<Option<Application>, StorageError>;

    fn list(&self) -> Result<Vec<Application>, StorageError>;
}

/// Storage trait for pairwise conflicts.
pub trait ConflictStore: Send + Sync {
    /// Insert a new conflict.
    ///
    /// Fails with `DuplicateKey` if a pending conflict already exists for the
    /// same pair and scope. This is the authoritative uniqueness check.
    fn insert(&self, conflict: Conflict) -> Result<(), StorageError>;

    fn get(&self, id: ConflictId) -> Result<Option<Conflict>, StorageError>;

    /// Replaces a stored conflict.
    ///
    /// The incoming revision must be exactly one past the stored revision.
    fn update(&self, conflict: Conflict) -> Result<(), StorageError>;

    /// The pending conflict for a pair and scope, if any.
    fn find_pending(&self, pair: PairKey, scope: ConflictScope) -> Result<Option<Conflict>, StorageError>;

    /// Conflicts involving a specific policy.
    fn find_by_policy(&self, policy_id: PolicyId) -> Result<Vec<Conflict>, StorageError>;

    /// Conflicts matching `filter`, oldest first.
    fn list(&self, filter: &ConflictFilter) -> Result<Vec<Conflict>, StorageError>;
}

/// Storage trait for inconsistent-enforcement findings.
pub trait InconsistencyStore: Send + Sync {
    fn insert(&self, finding: InconsistentEnforcement) -> Result<(), StorageError>;

    fn get(&self, id: InconsistencyId) -> Result<Option<InconsistentEnforcement>, StorageError>;

    /// Replaces a stored finding; the revision must advance by exactly one.
    fn update(&self, finding: InconsistentEnforcement) -> Result<(), StorageError>;

    /// Open (pending or acknowledged) findings for a resource type, oldest first.
    fn find_open_by_resource_type(&self, resource_type: &str) -> Result<Vec<InconsistentEnforcement>, StorageError>;

    /// Findings matching `filter`, oldest first.
    fn list(&self, filter: &InconsistencyFilter) -> Result<Vec<InconsistentEnforcement>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_policy_store_object_safe(_: &dyn PolicyStore) {}
    fn _assert_application_store_object_safe(_: &dyn ApplicationStore) {}
    fn _assert_conflict_store_object_safe(_: &dyn ConflictStore) {}
    fn _assert_inconsistency_store_object_safe(_: &dyn InconsistencyStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::PolicyNotFound(PolicyId::new());
        assert!(err.to_string().contains("Policy not found"));

        let err = StorageError::VersionConflict {
            key: "policy".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(err.to_string().contains("expected 1, found 2"));
    }

    #[test]
    fn test_conflict_filter_matches() {
        let a = PolicyId::new();
        let b = PolicyId::new();
        let conflict = Conflict::new(
            PairKey::new(a, b).unwrap(),
            ConflictScope::IntraApplication,
            ConflictType::Overlapping,
            Severity::Low,
            "invoice",
            "overlap",
        );
        assert!(ConflictFilter::pending().matches(&conflict));
        assert!(ConflictFilter::pending().with_severity(Severity::Low).matches(&conflict));
        assert!(!ConflictFilter::pending().with_severity(Severity::High).matches(&conflict));
        assert!(!ConflictFilter::default()
            .with_scope(ConflictScope::CrossApplication)
            .matches(&conflict));
        let by_policy = ConflictFilter {
            policy_id: Some(b),
            ..ConflictFilter::default()
        };
        assert!(by_policy.matches(&conflict));
    }
}
