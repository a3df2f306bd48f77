//! Pairwise conflict findings.
//!
//! Conflicts are explicit records, not hidden errors. A detection run creates
//! a Conflict for every candidate pair it classifies as contradictory,
//! overlapping, or inconsistent; only an explicit operator action resolves it.
//! Conflicts are never deleted, so resolved rows form the audit trail.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecutionError, ValidationError};
use crate::policy::{Policy, PolicyId, PolicyTemplate};
use crate::severity::Severity;

/// Unique identifier for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Creates a new random conflict ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the two policies belong to the same application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictScope {
    IntraApplication,
    CrossApplication,
}

impl fmt::Display for ConflictScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntraApplication => write!(f, "intra_application"),
            Self::CrossApplication => write!(f, "cross_application"),
        }
    }
}

/// The kind of disagreement between two policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Opposite decisions for overlapping inputs.
    Contradictory,
    /// Intersecting but non-contradictory scopes.
    Overlapping,
    /// Equivalent access enforced with materially different rules across applications.
    Inconsistent,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contradictory => write!(f, "contradictory"),
            Self::Overlapping => write!(f, "overlapping"),
            Self::Inconsistent => write!(f, "inconsistent"),
        }
    }
}

/// The status of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    #[default]
    Pending,
    Resolved,
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    KeepA,
    KeepB,
    Merge,
    Custom,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepA => write!(f, "keep_a"),
            Self::KeepB => write!(f, "keep_b"),
            Self::Merge => write!(f, "merge"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// An unordered pair of distinct policies in canonical order.
///
/// `(A, B)` and `(B, A)` produce the same key; together with the scope it is
/// the uniqueness key for pending conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    low: PolicyId,
    high: PolicyId,
}

impl PairKey {
    /// Creates the canonical key for two policies.
    pub fn new(a: PolicyId, b: PolicyId) -> Result<Self, ValidationError> {
        if a == b {
            return Err(ValidationError::SelfConflict { id: a });
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    /// The lower policy ID.
    #[must_use]
    pub const fn first(&self) -> PolicyId {
        self.low
    }

    /// The higher policy ID.
    #[must_use]
    pub const fn second(&self) -> PolicyId {
        self.high
    }

    /// Returns true if the pair contains the given policy.
    #[must_use]
    pub fn contains(&self, id: PolicyId) -> bool {
        self.low == id || self.high == id
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

/// A conflict between two policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub policy_a_id: PolicyId,
    pub policy_b_id: PolicyId,
    pub scope: ConflictScope,
    pub conflict_type: ConflictType,
    pub severity: Severity,

    /// Blocking key shared by both policies.
    pub resource_type: String,

    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_recommendation: Option<String>,

    /// Unified definition proposed by the recommendation service, used by `merge`
    /// when the operator does not supply one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_policy: Option<PolicyTemplate>,

    pub status: ConflictStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_strategy: Option<ResolutionStrategy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,

    /// Policy created by a `merge` or `custom` resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_policy_id: Option<PolicyId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Optimistic update token; stores accept an update only when it advances by one.
    #[serde(default)]
    pub revision: u64,
}

impl Conflict {
    /// Creates a new pending conflict for a canonical pair.
    #[must_use]
    pub fn new(
        pair: PairKey,
        scope: ConflictScope,
        conflict_type: ConflictType,
        severity: Severity,
        resource_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            policy_a_id: pair.first(),
            policy_b_id: pair.second(),
            scope,
            conflict_type,
            severity: severity.pairwise(),
            resource_type: resource_type.into(),
            description: description.into(),
            ai_recommendation: None,
            suggested_policy: None,
            status: ConflictStatus::Pending,
            resolution_strategy: None,
            resolution_notes: None,
            merged_policy_id: None,
            resolved_at: None,
            created_at: Utc::now(),
            revision: 0,
        }
    }

    /// Attaches the recommendation service's explanation and suggestion.
    #[must_use]
    pub fn with_advice(mut self, explanation: Option<String>, suggested: Option<PolicyTemplate>) -> Self {
        self.ai_recommendation = explanation.filter(|e| !e.trim().is_empty());
        self.suggested_policy = suggested;
        self
    }

    /// Returns the canonical pair key.
    #[must_use]
    pub fn pair_key(&self) -> PairKey {
        PairKey {
            low: self.policy_a_id.min(self.policy_b_id),
            high: self.policy_a_id.max(self.policy_b_id),
        }
    }

    /// Returns true if the conflict still awaits an operator decision.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    /// Returns true if the conflict is resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    /// Returns true if the conflict was explained by the recommendation service.
    #[must_use]
    pub fn is_explained(&self) -> bool {
        self.ai_recommendation.is_some()
    }

    /// Checks the stored-row invariants against the two policies involved.
    pub fn validate(&self, a: &Policy, b: &Policy) -> Result<(), ValidationError> {
        if self.policy_a_id == self.policy_b_id {
            return Err(ValidationError::SelfConflict { id: self.policy_a_id });
        }
        if self.scope == ConflictScope::CrossApplication && a.application_id == b.application_id {
            return Err(ValidationError::SameApplication);
        }
        if self.is_resolved() && self.resolution_strategy.is_none() {
            return Err(ValidationError::MissingField {
                field: "resolution_strategy".to_string(),
            });
        }
        Ok(())
    }

    /// Transitions `pending -> resolved`.
    ///
    /// Fails with `InvalidTransition` if the conflict is already resolved; the
    /// conflict is left unchanged in that case.
    pub fn resolve(
        &mut self,
        strategy: ResolutionStrategy,
        notes: Option<String>,
        merged_policy_id: Option<PolicyId>,
    ) -> Result<(), ExecutionError> {
        if self.is_resolved() {
            return Err(ExecutionError::InvalidTransition {
                kind: "conflict",
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: ConflictStatus::Resolved.to_string(),
            });
        }
        self.status = ConflictStatus::Resolved;
        self.resolution_strategy = Some(strategy);
        self.resolution_notes = notes;
        self.merged_policy_id = merged_policy_id;
        self.resolved_at = Some(Utc::now());
        self.revision += 1;
        Ok(())
    }
}

impl PartialEq for Conflict {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Conflict {}

impl std::hash::Hash for Conflict {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
