//! Rolling a unified policy out to one application at a time.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::application::ApplicationId;
use crate::error::{AccordResult, ExecutionError, ValidationError};
use crate::inconsistency::{InconsistencyId, InconsistencyStatus, InconsistentEnforcement};
use crate::policy::{Policy, PolicyId};
use crate::severity::RiskLevel;
use crate::storage::PolicyStore;

/// Outcome of an apply-unified request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub inconsistency_id: InconsistencyId,
    /// Targets that now carry the unified policy, including ones that
    /// already did before this request.
    pub applied: Vec<ApplicationId>,
    pub failed: Vec<ApplicationId>,
    /// Policies created by this request.
    pub created_policy_ids: Vec<PolicyId>,
    /// Finding status after the request.
    pub status: InconsistencyStatus,
}

impl ApplyReport {
    /// True if every target succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Creates the unified policy for one application and supersedes that
/// application's member policies.
///
/// The caller holds the policy locks of every member.
pub(crate) fn apply_to_application(
    policies: &dyn PolicyStore,
    finding: &InconsistentEnforcement,
    application_id: &ApplicationId,
) -> AccordResult<PolicyId> {
    let mut owned: Vec<Policy> = Vec::new();
    for id in &finding.policy_ids {
        match policies.get(*id)? {
            Some(p) if p.application_id.as_ref() == Some(application_id) => owned.push(p),
            Some(_) => {}
            None => warn!(policy = %id, finding = %finding.id, "member policy no longer exists"),
        }
    }
    if owned.is_empty() {
        return Err(ValidationError::OrphanApplication {
            application_id: application_id.clone(),
        }
        .into());
    }

    let mut live = Vec::with_capacity(owned.len());
    for p in owned {
        if p.is_active() {
            live.push(p);
        } else if !p.superseded_by.is_some_and(|by| finding.unified_policy_ids.contains(&by)) {
            return Err(ExecutionError::PolicyRetired {
                id: p.id,
                status: p.status,
            }
            .into());
        }
    }

    let risk = live.iter().map(|p| p.risk_level).max().unwrap_or(RiskLevel::Medium);
    let unified = finding.recommended_policy.to_policy(
        Some(application_id.clone()),
        risk,
        live.iter().map(|p| p.id).collect(),
    )?;
    let unified_id = unified.id;
    let unified_version = unified.version;
    policies.insert(unified)?;
    supersede_or_roll_back(policies, &live, unified_id, unified_version)?;

    debug!(
        finding = %finding.id,
        application = %application_id,
        unified = %unified_id,
        superseded = live.len(),
        "unified policy applied"
    );
    Ok(unified_id)
}

/// Supersedes every policy in `originals` with `replacement`, which the
/// caller has just inserted at `replacement_version`.
///
/// If any supersede fails, the originals already retired by this call are
/// reactivated and the replacement is deactivated before the error is
/// returned, leaving the store as it was for a retry.
pub(crate) fn supersede_or_roll_back(
    policies: &dyn PolicyStore,
    originals: &[Policy],
    replacement: PolicyId,
    replacement_version: u64,
) -> AccordResult<()> {
    let mut retired: Vec<Policy> = Vec::with_capacity(originals.len());
    for original in originals {
        match policies.supersede(original.id, original.version, Some(replacement)) {
            Ok(updated) => retired.push(updated),
            Err(e) => {
                warn!(
                    policy = %original.id,
                    replacement = %replacement,
                    rolled_back = retired.len(),
                    error = %e,
                    "supersede failed; rolling back"
                );
                for done in retired.iter().rev() {
                    if let Err(rollback) = policies.reactivate(done.id, done.version) {
                        warn!(policy = %done.id, error = %rollback, "could not reactivate superseded policy");
                    }
                }
                if let Err(rollback) = policies.deactivate(replacement, replacement_version) {
                    warn!(policy = %replacement, error = %rollback, "could not retire replacement policy");
                }
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;

    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use crate::policy::{Effect, PolicyTemplate};
    use crate::severity::Severity;
    use crate::storage::{InMemoryPolicyStore, StorageError};

    /// In-memory policy store whose `supersede` fails once for one policy.
    #[derive(Default)]
    pub(in crate::resolution) struct SupersedeFailsOnce {
        pub(in crate::resolution) inner: InMemoryPolicyStore,
        target: Mutex<Option<PolicyId>>,
    }

    impl SupersedeFailsOnce {
        pub(in crate::resolution) fn arm(&self, id: PolicyId) {
            *self.target.lock().unwrap() = Some(id);
        }
    }

    impl PolicyStore for SupersedeFailsOnce {
        fn insert(&self, policy: Policy) -> Result<(), StorageError> {
            self.inner.insert(policy)
        }

        fn get(&self, id: PolicyId) -> Result<Option<Policy>, StorageError> {
            self.inner.get(id)
        }

        fn list_in_scope(&self, applications: Option<&BTreeSet<ApplicationId>>) -> Result<Vec<Policy>, StorageError> {
            self.inner.list_in_scope(applications)
        }

        fn supersede(
            &self,
            id: PolicyId,
            expected_version: u64,
            superseded_by: Option<PolicyId>,
        ) -> Result<Policy, StorageError> {
            let mut target = self.target.lock().unwrap();
            if *target == Some(id) {
                *target = None;
                return Err(StorageError::BackendError("write timed out".to_string()));
            }
            drop(target);
            self.inner.supersede(id, expected_version, superseded_by)
        }

        fn deactivate(&self, id: PolicyId, expected_version: u64) -> Result<Policy, StorageError> {
            self.inner.deactivate(id, expected_version)
        }

        fn reactivate(&self, id: PolicyId, expected_version: u64) -> Result<Policy, StorageError> {
            self.inner.reactivate(id, expected_version)
        }
    }

    fn member(app: &str, subject: &str) -> Policy {
        Policy::builder()
            .application(app)
            .subject(subject)
            .resource("CustomerPII")
            .action("read")
            .risk_level(RiskLevel::High)
            .build()
            .unwrap()
    }

    fn finding(members: &[&Policy]) -> InconsistentEnforcement {
        InconsistentEnforcement::new(
            "customer_pii",
            BTreeSet::from(["read".to_string()]),
            members.iter().filter_map(|p| p.application_id.clone()).collect(),
            members.iter().map(|p| p.id).collect(),
            BTreeSet::new(),
            "differs",
            Severity::High,
            PolicyTemplate {
                subject: "admin".to_string(),
                resource: "CustomerPII".to_string(),
                action: "read".to_string(),
                conditions: Some("mfa == true".to_string()),
                effect: Effect::Allow,
            },
            "require admin with MFA",
            true,
        )
    }

    #[test]
    fn test_apply_creates_policy_and_supersedes_members() {
        let store = InMemoryPolicyStore::new();
        let a = member("app1", "admin");
        let b = member("app2", "");
        store.insert(a.clone()).unwrap();
        store.insert(b.clone()).unwrap();
        let f = finding(&[&a, &b]);

        let unified = apply_to_application(&store, &f, &ApplicationId::new("app1")).unwrap();
        let created = store.get(unified).unwrap().unwrap();
        assert_eq!(created.application_id, Some(ApplicationId::new("app1")));
        assert_eq!(created.derived_from, vec![a.id]);
        assert_eq!(created.risk_level, RiskLevel::High);

        let old = store.get(a.id).unwrap().unwrap();
        assert_eq!(old.superseded_by, Some(unified));
        assert!(store.get(b.id).unwrap().unwrap().is_active());
    }

    #[test]
    fn test_apply_rejects_externally_retired_member() {
        let store = InMemoryPolicyStore::new();
        let a = member("app1", "admin");
        let b = member("app2", "");
        store.insert(a.clone()).unwrap();
        store.insert(b.clone()).unwrap();
        store.supersede(a.id, a.version, None).unwrap();

        let err = apply_to_application(&store, &finding(&[&a, &b]), &ApplicationId::new("app1")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::AccordError::Execution(ExecutionError::PolicyRetired { id, .. }) if id == a.id
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_failed_supersede_restores_earlier_members() {
        let store = SupersedeFailsOnce::default();
        let first = member("app2", "admin");
        let second = member("app2", "auditor");
        let other = member("app1", "");
        for p in [&first, &second, &other] {
            store.insert((*p).clone()).unwrap();
        }
        // Members are superseded in id order; fail the one handled last.
        let last = first.id.max(second.id);
        store.arm(last);
        let f = finding(&[&first, &second, &other]);
        let app2 = ApplicationId::new("app2");

        let err = apply_to_application(&store, &f, &app2).unwrap_err();
        assert!(err.to_string().contains("write timed out"));
        for id in [first.id, second.id] {
            let p = store.get(id).unwrap().unwrap();
            assert!(p.is_active(), "member {id} left {}", p.status);
            assert_eq!(p.superseded_by, None);
        }
        let leftovers: Vec<Policy> = store
            .list_in_scope(None)
            .unwrap()
            .into_iter()
            .filter(|p| !p.derived_from.is_empty())
            .collect();
        assert_eq!(leftovers.len(), 1);
        assert!(!leftovers[0].is_active());

        let unified = apply_to_application(&store, &f, &app2).unwrap();
        for id in [first.id, second.id] {
            assert_eq!(store.get(id).unwrap().unwrap().superseded_by, Some(unified));
        }
    }

    #[test]
    fn test_apply_unknown_owner_is_orphan() {
        let store = InMemoryPolicyStore::new();
        let a = member("app1", "admin");
        let b = member("app2", "");
        store.insert(a.clone()).unwrap();
        store.insert(b.clone()).unwrap();
        let err = apply_to_application(&store, &finding(&[&a, &b]), &ApplicationId::new("app9")).unwrap_err();
        assert!(err.is_validation());
    }
}
