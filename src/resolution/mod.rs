//! Resolution manager.
//!
//! Applies operator decisions: resolving pairwise conflicts, moving
//! inconsistent-enforcement findings through their lifecycle, and rolling
//! unified policies out to affected applications.
//!
//! Every mutation runs under the striped locks of the policies involved and
//! re-reads its target inside the lock. Stores additionally enforce
//! optimistic version checks, so writers outside this process are detected
//! as `ConcurrentResolutionConflict`.

mod apply;
mod locks;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::application::ApplicationId;
use crate::conflict::{Conflict, ConflictId, ResolutionStrategy};
use crate::error::{AccordResult, ExecutionError, ValidationError};
use crate::inconsistency::{InconsistencyId, InconsistencyStatus, InconsistentEnforcement};
use crate::policy::{Policy, PolicyId, PolicyTemplate};
use crate::storage::{ConflictStore, InconsistencyStore, PolicyStore};

pub use apply::ApplyReport;
pub use locks::{PolicyLockGuard, PolicyLocks};

/// An operator's decision on a pairwise conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Keep policy A, supersede B.
    KeepA,
    /// Keep policy B, supersede A.
    KeepB,
    /// Replace both with one policy. Without an explicit definition the
    /// recommendation service's suggestion is used, then a computed merge.
    Merge(Option<PolicyTemplate>),
    /// Replace both with an operator-authored policy.
    Custom(PolicyTemplate),
}

impl Resolution {
    /// Builds a resolution from a strategy name and optional definition.
    pub fn from_strategy(
        strategy: ResolutionStrategy,
        definition: Option<PolicyTemplate>,
    ) -> Result<Self, ValidationError> {
        Ok(match strategy {
            ResolutionStrategy::KeepA => Self::KeepA,
            ResolutionStrategy::KeepB => Self::KeepB,
            ResolutionStrategy::Merge => Self::Merge(definition),
            ResolutionStrategy::Custom => Self::Custom(definition.ok_or_else(|| {
                ValidationError::MissingUnifiedPolicy {
                    strategy: strategy.to_string(),
                }
            })?),
        })
    }

    #[must_use]
    pub const fn strategy(&self) -> ResolutionStrategy {
        match self {
            Self::KeepA => ResolutionStrategy::KeepA,
            Self::KeepB => ResolutionStrategy::KeepB,
            Self::Merge(_) => ResolutionStrategy::Merge,
            Self::Custom(_) => ResolutionStrategy::Custom,
        }
    }
}

/// Applies resolutions against the stores.
pub struct ResolutionManager {
    policies: Arc<dyn PolicyStore>,
    conflicts: Arc<dyn ConflictStore>,
    inconsistencies: Arc<dyn InconsistencyStore>,
    locks: PolicyLocks,
}

impl std::fmt::Debug for ResolutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionManager")
            .field("lock_stripes", &self.locks.stripe_count())
            .finish_non_exhaustive()
    }
}

impl ResolutionManager {
    #[must_use]
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        conflicts: Arc<dyn ConflictStore>,
        inconsistencies: Arc<dyn InconsistencyStore>,
        lock_stripes: usize,
    ) -> Self {
        Self {
            policies,
            conflicts,
            inconsistencies,
            locks: PolicyLocks::new(lock_stripes),
        }
    }

    fn load_conflict(&self, id: ConflictId) -> AccordResult<Conflict> {
        Ok(self
            .conflicts
            .get(id)?
            .ok_or(ExecutionError::ConflictNotFound { id })?)
    }

    fn load_finding(&self, id: InconsistencyId) -> AccordResult<InconsistentEnforcement> {
        Ok(self
            .inconsistencies
            .get(id)?
            .ok_or(ExecutionError::InconsistencyNotFound { id })?)
    }

    fn load_policy(&self, id: PolicyId) -> AccordResult<Policy> {
        Ok(self.policies.get(id)?.ok_or(ExecutionError::PolicyNotFound { id })?)
    }

    fn load_active(&self, id: PolicyId) -> AccordResult<Policy> {
        let policy = self.load_policy(id)?;
        if !policy.is_active() {
            return Err(ExecutionError::PolicyRetired {
                id,
                status: policy.status,
            }
            .into());
        }
        Ok(policy)
    }

    /// Keeps `winner` and supersedes `loser` with it. A loser that an
    /// earlier resolution already retired needs no further change.
    fn keep(&self, conflict: ConflictId, winner: PolicyId, loser: PolicyId) -> AccordResult<()> {
        self.load_active(winner)?;
        let loser = self.load_policy(loser)?;
        if loser.is_active() {
            self.policies.supersede(loser.id, loser.version, Some(winner))?;
        } else {
            info!(
                conflict = %conflict,
                policy = %loser.id,
                status = %loser.status,
                "losing policy already retired"
            );
        }
        Ok(())
    }

    /// Resolves a pending conflict.
    ///
    /// # Errors
    /// - `ConflictNotFound` / `PolicyNotFound`
    /// - `InvalidTransition` if the conflict is already resolved
    /// - `PolicyRetired` if the kept policy, or either side of a merge or
    ///   custom replacement, was already retired by another resolution
    /// - `ConcurrentResolutionConflict` if a policy changed underneath the
    ///   resolution
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: Resolution,
        notes: Option<String>,
    ) -> AccordResult<Conflict> {
        let snapshot = self.load_conflict(id)?;
        let _guard = self.locks.lock_all(&[snapshot.policy_a_id, snapshot.policy_b_id])?;

        let mut conflict = self.load_conflict(id)?;
        if conflict.is_resolved() {
            return Err(ExecutionError::InvalidTransition {
                kind: "conflict",
                id: id.to_string(),
                from: conflict.status.to_string(),
                to: "resolved".to_string(),
            }
            .into());
        }

        let strategy = resolution.strategy();
        let merged_policy_id = match resolution {
            Resolution::KeepA => {
                self.keep(id, conflict.policy_a_id, conflict.policy_b_id)?;
                None
            }
            Resolution::KeepB => {
                self.keep(id, conflict.policy_b_id, conflict.policy_a_id)?;
                None
            }
            Resolution::Merge(definition) => {
                let a = self.load_active(conflict.policy_a_id)?;
                let b = self.load_active(conflict.policy_b_id)?;
                let template = definition
                    .or_else(|| conflict.suggested_policy.clone())
                    .unwrap_or_else(|| PolicyTemplate::merge(&a, &b));
                Some(self.replace_pair(&a, &b, &template)?)
            }
            Resolution::Custom(template) => {
                let a = self.load_active(conflict.policy_a_id)?;
                let b = self.load_active(conflict.policy_b_id)?;
                Some(self.replace_pair(&a, &b, &template)?)
            }
        };

        conflict.resolve(strategy, notes, merged_policy_id)?;
        self.conflicts.update(conflict.clone())?;
        info!(conflict = %id, %strategy, merged = ?merged_policy_id, "conflict resolved");
        Ok(conflict)
    }

    /// Inserts the replacement policy and supersedes both originals with it,
    /// undoing both steps if either supersede fails.
    fn replace_pair(&self, a: &Policy, b: &Policy, template: &PolicyTemplate) -> AccordResult<PolicyId> {
        let application = if a.application_id == b.application_id {
            a.application_id.clone()
        } else {
            None
        };
        let merged = template.to_policy(application, a.risk_level.max(b.risk_level), vec![a.id, b.id])?;
        let merged_id = merged.id;
        let merged_version = merged.version;
        self.policies.insert(merged)?;
        apply::supersede_or_roll_back(self.policies.as_ref(), &[a.clone(), b.clone()], merged_id, merged_version)?;
        Ok(merged_id)
    }

    /// Changes the status of an inconsistent-enforcement finding.
    ///
    /// Moving to `Resolved` applies the unified policy to every application
    /// that has not received it yet; if any application fails the finding
    /// stays `Acknowledged` and `PartialApplyFailure` is returned.
    pub fn update_status(
        &self,
        id: InconsistencyId,
        status: InconsistencyStatus,
        notes: Option<String>,
        resolved_by: Option<String>,
    ) -> AccordResult<InconsistentEnforcement> {
        let snapshot = self.load_finding(id)?;
        let members: Vec<PolicyId> = snapshot.policy_ids.iter().copied().collect();
        let _guard = self.locks.lock_all(&members)?;

        let mut finding = self.load_finding(id)?;
        if status == InconsistencyStatus::Resolved {
            if !finding.status.can_transition_to(status) {
                return Err(invalid_transition(&finding, status));
            }
            let targets: Vec<ApplicationId> = finding.outstanding_applications().into_iter().collect();
            let report = self.apply_locked(&mut finding, &targets, notes, resolved_by)?;
            if !report.is_complete() {
                return Err(ExecutionError::PartialApplyFailure {
                    applied: report.applied,
                    failed: report.failed,
                }
                .into());
            }
            return Ok(finding);
        }

        finding.transition(status, notes, resolved_by)?;
        self.inconsistencies.update(finding.clone())?;
        info!(finding = %id, %status, "finding status updated");
        Ok(finding)
    }

    /// Applies the recommended unified policy to `targets` (every
    /// outstanding application when empty).
    ///
    /// A pending finding is acknowledged first. Applications that already
    /// carry the unified policy are reported as applied without being
    /// touched again. The finding becomes `Resolved` once every affected
    /// application has it.
    pub fn apply_unified_policy(&self, id: InconsistencyId, targets: &[ApplicationId]) -> AccordResult<ApplyReport> {
        let snapshot = self.load_finding(id)?;
        let members: Vec<PolicyId> = snapshot.policy_ids.iter().copied().collect();
        let _guard = self.locks.lock_all(&members)?;

        let mut finding = self.load_finding(id)?;
        if finding.status.is_terminal() {
            return Err(invalid_transition(&finding, InconsistencyStatus::Resolved));
        }
        for target in targets {
            if !finding.affected_application_ids.contains(target) {
                return Err(ValidationError::UnknownTarget {
                    application_id: target.clone(),
                }
                .into());
            }
        }
        let targets: Vec<ApplicationId> = if targets.is_empty() {
            finding.outstanding_applications().into_iter().collect()
        } else {
            targets.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
        };
        self.apply_locked(&mut finding, &targets, None, None)
    }

    /// Applies to each target, then records the outcome with a single store
    /// write. The caller holds the member locks.
    fn apply_locked(
        &self,
        finding: &mut InconsistentEnforcement,
        targets: &[ApplicationId],
        notes: Option<String>,
        resolved_by: Option<String>,
    ) -> AccordResult<ApplyReport> {
        let stored_revision = finding.revision;
        if finding.status == InconsistencyStatus::Pending {
            finding.transition(InconsistencyStatus::Acknowledged, None, None)?;
        }

        let mut applied = Vec::new();
        let mut failed = Vec::new();
        let mut created = Vec::new();
        for app in targets {
            if finding.applied_application_ids.contains(app) {
                applied.push(app.clone());
                continue;
            }
            match apply::apply_to_application(self.policies.as_ref(), finding, app) {
                Ok(policy_id) => {
                    finding.applied_application_ids.insert(app.clone());
                    finding.unified_policy_ids.push(policy_id);
                    created.push(policy_id);
                    applied.push(app.clone());
                }
                Err(e) => {
                    warn!(finding = %finding.id, application = %app, error = %e, "apply-unified failed");
                    failed.push(app.clone());
                }
            }
        }

        if finding.outstanding_applications().is_empty() {
            finding.transition(InconsistencyStatus::Resolved, notes, resolved_by)?;
        } else if !failed.is_empty() {
            let names: Vec<&str> = failed.iter().map(ApplicationId::as_str).collect();
            let failure = format!("apply-unified failed for: {}", names.join(", "));
            finding.resolution_notes = Some(match notes {
                Some(n) => format!("{n}; {failure}"),
                None => failure,
            });
        } else if notes.is_some() {
            finding.resolution_notes = notes;
        }
        finding.revision = stored_revision + 1;
        finding.updated_at = Utc::now();
        self.inconsistencies.update(finding.clone())?;

        info!(
            finding = %finding.id,
            applied = applied.len(),
            failed = failed.len(),
            status = %finding.status,
            "apply-unified finished"
        );
        Ok(ApplyReport {
            inconsistency_id: finding.id,
            applied,
            failed,
            created_policy_ids: created,
            status: finding.status,
        })
    }
}

fn invalid_transition(finding: &InconsistentEnforcement, to: InconsistencyStatus) -> crate::error::AccordError {
    ExecutionError::InvalidTransition {
        kind: "inconsistent_enforcement",
        id: finding.id.to_string(),
        from: finding.status.to_string(),
        to: to.to_string(),
    }
    .into()
}
