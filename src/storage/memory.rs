//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::application::{Application, ApplicationId};
use crate::conflict::{Conflict, ConflictId, ConflictScope, PairKey};
use crate::inconsistency::{InconsistencyId, InconsistentEnforcement};
use crate::policy::{Policy, PolicyId, PolicyStatus};
use crate::storage::traits::{
    ApplicationStore, ConflictFilter, ConflictStore, InconsistencyFilter, InconsistencyStore, PolicyStore,
    StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn check_revision(key: String, stored: u64, incoming: u64) -> Result<(), StorageError> {
    if incoming != stored + 1 {
        return Err(StorageError::VersionConflict {
            key,
            expected: stored + 1,
            actual: incoming,
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct PolicyState {
    by_id: HashMap<PolicyId, Policy>,
    by_application: HashMap<Option<ApplicationId>, Vec<PolicyId>>,
}

/// Thread-safe in-memory policy store.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    state: RwLock<PolicyState>,
}

impl InMemoryPolicyStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        id: PolicyId,
        expected_version: u64,
        context: &'static str,
        apply: impl FnOnce(&mut Policy),
    ) -> Result<Policy, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err(context))?;
        let policy = state.by_id.get_mut(&id).ok_or(StorageError::PolicyNotFound(id))?;
        if policy.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: id.to_string(),
                expected: expected_version,
                actual: policy.version,
            });
        }
        apply(policy);
        Ok(policy.clone())
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn insert(&self, policy: Policy) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("policy.insert"))?;
        if state.by_id.contains_key(&policy.id) {
            return Err(StorageError::DuplicateKey(policy.id.to_string()));
        }
        state
            .by_application
            .entry(policy.application_id.clone())
            .or_default()
            .push(policy.id);
        state.by_id.insert(policy.id, policy);
        Ok(())
    }

    fn get(&self, id: PolicyId) -> Result<Option<Policy>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("policy.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn list_in_scope(&self, applications: Option<&BTreeSet<ApplicationId>>) -> Result<Vec<Policy>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("policy.list_in_scope"))?;
        let mut out: Vec<Policy> = match applications {
            None => state.by_id.values().cloned().collect(),
            Some(apps) => apps
                .iter()
                .filter_map(|app| state.by_application.get(&Some(app.clone())))
                .flatten()
                .filter_map(|id| state.by_id.get(id).cloned())
                .collect(),
        };
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn supersede(
        &self,
        id: PolicyId,
        expected_version: u64,
        superseded_by: Option<PolicyId>,
    ) -> Result<Policy, StorageError> {
        self.transition(id, expected_version, "policy.supersede", |p| {
            p.mark_superseded(superseded_by);
        })
    }

    fn deactivate(&self, id: PolicyId, expected_version: u64) -> Result<Policy, StorageError> {
        self.transition(id, expected_version, "policy.deactivate", |p| {
            p.status = PolicyStatus::Inactive;
            p.version = p.version.saturating_add(1);
        })
    }

    fn reactivate(&self, id: PolicyId, expected_version: u64) -> Result<Policy, StorageError> {
        self.transition(id, expected_version, "policy.reactivate", |p| {
            p.status = PolicyStatus::Active;
            p.superseded_by = None;
            p.version = p.version.saturating_add(1);
        })
    }
}

/// Thread-safe in-memory application registry.
#[derive(Debug, Default)]
pub struct InMemoryApplicationStore {
    state: RwLock<HashMap<ApplicationId, Application>>,
}

impl InMemoryApplicationStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApplicationStore for InMemoryApplicationStore {
    fn upsert(&self, application: Application) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("application.upsert"))?;
        state.insert(application.id.clone(), application);
        Ok(())
    }

    fn get(&self, id: &ApplicationId) -> Result<Option<Application>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("application.get"))?;
        Ok(state.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Application>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("application.list"))?;
        let mut out: Vec<Application> = state.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct ConflictState {
    by_id: HashMap<ConflictId, Conflict>,
    pending: HashMap<(PairKey, ConflictScope), ConflictId>,
    by_policy: HashMap<PolicyId, Vec<ConflictId>>,
}

/// Thread-safe in-memory conflict store.
#[derive(Debug, Default)]
pub struct InMemoryConflictStore {
    state: RwLock<ConflictState>,
}

impl InMemoryConflictStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConflictStore for InMemoryConflictStore {
    fn insert(&self, conflict: Conflict) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("conflict.insert"))?;

        if state.by_id.contains_key(&conflict.id) {
            return Err(StorageError::DuplicateKey(conflict.id.to_string()));
        }
        let key = (conflict.pair_key(), conflict.scope);
        if conflict.is_pending() {
            if let Some(existing) = state.pending.get(&key) {
                return Err(StorageError::DuplicateKey(format!(
                    "pending conflict {existing} already covers {}",
                    key.0
                )));
            }
            state.pending.insert(key, conflict.id);
        }
        for policy_id in [conflict.policy_a_id, conflict.policy_b_id] {
            state.by_policy.entry(policy_id).or_default().push(conflict.id);
        }
        state.by_id.insert(conflict.id, conflict);
        Ok(())
    }

    fn get(&self, id: ConflictId) -> Result<Option<Conflict>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("conflict.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn update(&self, conflict: Conflict) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("conflict.update"))?;

        let old = state
            .by_id
            .get(&conflict.id)
            .ok_or(StorageError::ConflictNotFound(conflict.id))?;
        if old.pair_key() != conflict.pair_key() || old.scope != conflict.scope {
            return Err(StorageError::Rejected(format!(
                "conflict {} may not change its policy pair or scope",
                conflict.id
            )));
        }
        check_revision(conflict.id.to_string(), old.revision, conflict.revision)?;

        let key = (conflict.pair_key(), conflict.scope);
        if conflict.is_pending() {
            match state.pending.get(&key) {
                Some(existing) if *existing != conflict.id => {
                    return Err(StorageError::DuplicateKey(format!(
                        "pending conflict {existing} already covers {}",
                        key.0
                    )));
                }
                _ => {
                    state.pending.insert(key, conflict.id);
                }
            }
        } else if state.pending.get(&key) == Some(&conflict.id) {
            state.pending.remove(&key);
        }

        state.by_id.insert(conflict.id, conflict);
        Ok(())
    }

    fn find_pending(&self, pair: PairKey, scope: ConflictScope) -> Result<Option<Conflict>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("conflict.find_pending"))?;
        Ok(state
            .pending
            .get(&(pair, scope))
            .and_then(|id| state.by_id.get(id))
            .cloned())
    }

    fn find_by_policy(&self, policy_id: PolicyId) -> Result<Vec<Conflict>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("conflict.find_by_policy"))?;
        let mut out: Vec<Conflict> = state
            .by_policy
            .get(&policy_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.by_id.get(id).cloned())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn list(&self, filter: &ConflictFilter) -> Result<Vec<Conflict>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("conflict.list"))?;
        let mut out: Vec<Conflict> = state
            .by_id
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct InconsistencyState {
    by_id: HashMap<InconsistencyId, InconsistentEnforcement>,
    by_resource: HashMap<String, Vec<InconsistencyId>>,
}

/// Thread-safe in-memory store for inconsistent-enforcement findings.
#[derive(Debug, Default)]
pub struct InMemoryInconsistencyStore {
    state: RwLock<InconsistencyState>,
}

impl InMemoryInconsistencyStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first(findings: &mut [InconsistentEnforcement]) {
    findings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

impl InconsistencyStore for InMemoryInconsistencyStore {
    fn insert(&self, finding: InconsistentEnforcement) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("inconsistency.insert"))?;
        if state.by_id.contains_key(&finding.id) {
            return Err(StorageError::DuplicateKey(finding.id.to_string()));
        }
        state
            .by_resource
            .entry(finding.resource_type.clone())
            .or_default()
            .push(finding.id);
        state.by_id.insert(finding.id, finding);
        Ok(())
    }

    fn get(&self, id: InconsistencyId) -> Result<Option<InconsistentEnforcement>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("inconsistency.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn update(&self, finding: InconsistentEnforcement) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("inconsistency.update"))?;
        let old = state
            .by_id
            .get(&finding.id)
            .ok_or(StorageError::InconsistencyNotFound(finding.id))?;
        if old.resource_type != finding.resource_type {
            return Err(StorageError::Rejected(format!(
                "finding {} may not change its resource type",
                finding.id
            )));
        }
        if old.status.is_terminal() {
            return Err(StorageError::Rejected(format!(
                "finding {} is {} and can no longer change",
                finding.id, old.status
            )));
        }
        check_revision(finding.id.to_string(), old.revision, finding.revision)?;
        state.by_id.insert(finding.id, finding);
        Ok(())
    }

    fn find_open_by_resource_type(&self, resource_type: &str) -> Result<Vec<InconsistentEnforcement>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("inconsistency.find_open_by_resource_type"))?;
        let mut out: Vec<InconsistentEnforcement> = state
            .by_resource
            .get(resource_type)
            .into_iter()
            .flatten()
            .filter_map(|id| state.by_id.get(id))
            .filter(|f| f.is_open())
            .cloned()
            .collect();
        oldest_first(&mut out);
        Ok(out)
    }

    fn list(&self, filter: &InconsistencyFilter) -> Result<Vec<InconsistentEnforcement>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("inconsistency.list"))?;
        let mut out: Vec<InconsistentEnforcement> = state
            .by_id
            .values()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect();
        oldest_first(&mut out);
        Ok(out)
    }
}

/// Convenience bundle of in-memory stores.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    /// Policy store.
    pub policies: InMemoryPolicyStore,
    /// Application registry.
    pub applications: InMemoryApplicationStore,
    /// Conflict store.
    pub conflicts: InMemoryConflictStore,
    /// Inconsistent-enforcement store.
    pub inconsistencies: InMemoryInconsistencyStore,
}

impl InMemoryStores {
    /// Create a new bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
