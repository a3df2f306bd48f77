//! Group findings: one logical resource enforced differently across applications.
//!
//! An `InconsistentEnforcement` collapses every `inconsistent` cross-application
//! conflict edge for a resource type into a single finding carrying one
//! recommended unified policy.
//!
//! State machine:
//!
//! ```text
//! pending ──> acknowledged ──> resolved
//!    │              │
//!    └──> dismissed <┘
//! ```

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::application::ApplicationId;
use crate::conflict::ConflictId;
use crate::error::{ExecutionError, ValidationError};
use crate::policy::{Policy, PolicyId, PolicyTemplate};
use crate::severity::Severity;

/// Unique identifier for an inconsistent enforcement finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InconsistencyId(Uuid);

impl InconsistencyId {
    /// Creates a new random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InconsistencyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InconsistencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a group finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyStatus {
    #[default]
    Pending,
    Acknowledged,
    Resolved,
    Dismissed,
}

impl InconsistencyStatus {
    /// Returns true if `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Acknowledged)
                | (Self::Pending, Self::Dismissed)
                | (Self::Acknowledged, Self::Dismissed)
                | (Self::Acknowledged, Self::Resolved)
        )
    }

    /// Returns true for `resolved` and `dismissed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed)
    }
}

impl fmt::Display for InconsistencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Resolved => write!(f, "resolved"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// Divergent enforcement of the same resource type across applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InconsistentEnforcement {
    pub id: InconsistencyId,

    /// Normalized blocking key shared by every member policy.
    pub resource_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_description: Option<String>,

    /// Normalized actions covered by the member policies.
    pub actions: BTreeSet<String>,

    pub affected_application_ids: BTreeSet<ApplicationId>,
    pub policy_ids: BTreeSet<PolicyId>,

    /// The `inconsistent` conflict edges this finding was aggregated from.
    pub conflict_ids: BTreeSet<ConflictId>,

    pub inconsistency_description: String,
    pub severity: Severity,
    pub recommended_policy: PolicyTemplate,
    pub recommendation_explanation: String,

    /// False when the recommendation is the deterministic fallback because the
    /// recommendation service timed out or was unavailable.
    pub explained: bool,

    pub status: InconsistencyStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    /// Applications that already received the unified policy.
    #[serde(default)]
    pub applied_application_ids: BTreeSet<ApplicationId>,

    /// Policies created by apply-unified, one per applied application.
    #[serde(default)]
    pub unified_policy_ids: Vec<PolicyId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub revision: u64,
}

impl InconsistentEnforcement {
    /// Creates a pending finding.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        resource_type: impl Into<String>,
        actions: BTreeSet<String>,
        affected_application_ids: BTreeSet<ApplicationId>,
        policy_ids: BTreeSet<PolicyId>,
        conflict_ids: BTreeSet<ConflictId>,
        description: impl Into<String>,
        severity: Severity,
        recommended_policy: PolicyTemplate,
        explanation: impl Into<String>,
        explained: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InconsistencyId::new(),
            resource_type: resource_type.into(),
            resource_description: None,
            actions,
            affected_application_ids,
            policy_ids,
            conflict_ids,
            inconsistency_description: description.into(),
            severity,
            recommended_policy,
            recommendation_explanation: explanation.into(),
            explained,
            status: InconsistencyStatus::Pending,
            resolution_notes: None,
            resolved_by: None,
            resolved_at: None,
            applied_application_ids: BTreeSet::new(),
            unified_policy_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Returns true while the finding is `pending` or `acknowledged`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Affected applications that have not received the unified policy yet.
    #[must_use]
    pub fn outstanding_applications(&self) -> BTreeSet<ApplicationId> {
        self.affected_application_ids
            .difference(&self.applied_application_ids)
            .cloned()
            .collect()
    }

    /// Checks the size and ownership invariants against the member policies.
    pub fn validate(&self, members: &[Policy]) -> Result<(), ValidationError> {
        if self.affected_application_ids.len() < 2 {
            return Err(ValidationError::GroupTooSmall {
                what: "applications",
                min: 2,
                actual: self.affected_application_ids.len(),
            });
        }
        if self.policy_ids.len() < 2 {
            return Err(ValidationError::GroupTooSmall {
                what: "policies",
                min: 2,
                actual: self.policy_ids.len(),
            });
        }
        for app in &self.affected_application_ids {
            let owns_one = members
                .iter()
                .any(|p| self.policy_ids.contains(&p.id) && p.application_id.as_ref() == Some(app));
            if !owns_one {
                return Err(ValidationError::OrphanApplication {
                    application_id: app.clone(),
                });
            }
        }
        Ok(())
    }

    /// Applies a status transition, rejecting illegal ones without mutating.
    pub fn transition(
        &mut self,
        to: InconsistencyStatus,
        notes: Option<String>,
        resolved_by: Option<String>,
    ) -> Result<(), ExecutionError> {
        if !self.status.can_transition_to(to) {
            return Err(ExecutionError::InvalidTransition {
                kind: "inconsistent_enforcement",
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.status = to;
        if notes.is_some() {
            self.resolution_notes = notes;
        }
        if to.is_terminal() {
            self.resolved_at = Some(now);
            if resolved_by.is_some() {
                self.resolved_by = resolved_by;
            }
        }
        self.touch(now);
        Ok(())
    }

    /// Unions another group's members into this one.
    ///
    /// Returns true if any member set grew.
    pub fn absorb(&mut self, other: &Self) -> bool {
        let before = (
            self.policy_ids.len(),
            self.affected_application_ids.len(),
            self.conflict_ids.len(),
            self.actions.len(),
        );
        self.policy_ids.extend(other.policy_ids.iter().copied());
        self.affected_application_ids
            .extend(other.affected_application_ids.iter().cloned());
        self.conflict_ids.extend(other.conflict_ids.iter().copied());
        self.actions.extend(other.actions.iter().cloned());
        let after = (
            self.policy_ids.len(),
            self.affected_application_ids.len(),
            self.conflict_ids.len(),
            self.actions.len(),
        );
        before != after
    }

    /// Bumps the revision and the update timestamp.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.revision += 1;
    }
}

impl PartialEq for InconsistentEnforcement {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for InconsistentEnforcement {}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(app: &str) -> Policy {
        Policy::builder()
            .application(app)
            .subject("ADMIN")
            .resource("CustomerPII")
            .action("read")
            .build()
            .unwrap()
    }

    fn group(members: &[Policy]) -> InconsistentEnforcement {
        InconsistentEnforcement::new(
            "customer_pii",
            BTreeSet::from(["read".to_string()]),
            members.iter().filter_map(|p| p.application_id.clone()).collect(),
            members.iter().map(|p| p.id).collect(),
            BTreeSet::new(),
            "read enforced three ways",
            Severity::High,
            members[0].template(),
            "unify on ADMIN",
            true,
        )
    }

    #[test]
    fn test_state_machine_table() {
        use InconsistencyStatus::*;
        assert!(Pending.can_transition_to(Acknowledged));
        assert!(Pending.can_transition_to(Dismissed));
        assert!(Acknowledged.can_transition_to(Resolved));
        assert!(Acknowledged.can_transition_to(Dismissed));
        assert!(!Pending.can_transition_to(Resolved));
        assert!(!Resolved.can_transition_to(Dismissed));
        assert!(!Dismissed.can_transition_to(Acknowledged));
        assert!(!Acknowledged.can_transition_to(Acknowledged));
    }

    #[test]
    fn test_transition_records_resolution() {
        let members = vec![member("a"), member("b")];
        let mut g = group(&members);
        g.transition(InconsistencyStatus::Acknowledged, None, None).unwrap();
        assert!(g.resolved_at.is_none());
        g.transition(
            InconsistencyStatus::Dismissed,
            Some("accepted risk".to_string()),
            Some("alice".to_string()),
        )
        .unwrap();
        assert!(!g.is_open());
        assert_eq!(g.resolved_by.as_deref(), Some("alice"));
        assert_eq!(g.revision, 2);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let members = vec![member("a"), member("b")];
        let mut g = group(&members);
        g.transition(InconsistencyStatus::Dismissed, None, None).unwrap();
        let err = g
            .transition(InconsistencyStatus::Acknowledged, None, None)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidTransition { .. }));
        assert_eq!(g.status, InconsistencyStatus::Dismissed);
    }

    #[test]
    fn test_validate_invariants() {
        let members = vec![member("a"), member("b")];
        let g = group(&members);
        assert!(g.validate(&members).is_ok());

        let mut orphan = g.clone();
        orphan.affected_application_ids.insert(ApplicationId::new("c"));
        assert!(matches!(
            orphan.validate(&members),
            Err(ValidationError::OrphanApplication { .. })
        ));

        let single = group(&members[..1]);
        assert!(matches!(
            single.validate(&members),
            Err(ValidationError::GroupTooSmall { what: "applications", .. })
        ));
    }

    #[test]
    fn test_absorb_and_outstanding() {
        let first = vec![member("a"), member("b")];
        let second = vec![member("b"), member("c")];
        let mut g = group(&first);
        let other = group(&second);
        assert!(g.absorb(&other));
        assert_eq!(g.affected_application_ids.len(), 3);
        assert_eq!(g.policy_ids.len(), 4);
        assert!(!g.absorb(&other));

        g.applied_application_ids.insert(ApplicationId::new("a"));
        let outstanding = g.outstanding_applications();
        assert_eq!(outstanding.len(), 2);
        assert!(!outstanding.contains(&ApplicationId::new("a")));
    }
}
