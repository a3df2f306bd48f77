//! Policy index: groups policies into blocking buckets.
//!
//! Policies live in an arena; buckets hold arena indices. Only policies in
//! the same bucket are ever compared, so pair generation stays
//! sub-quadratic in the corpus size.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tracing::debug;

use crate::application::{ApplicationId, Criticality};
use crate::classify::{ConditionSet, SubjectScope};
use crate::conflict::ConflictScope;
use crate::normalize::Vocabulary;
use crate::policy::{Policy, PolicyId};

/// A policy together with the normalized facts classification runs on.
#[derive(Debug, Clone)]
pub struct PolicyFacts {
    pub policy: Policy,
    /// Normalized resource; the blocking key.
    pub resource_key: String,
    /// Canonical action.
    pub action: String,
    pub subject: SubjectScope,
    pub conditions: ConditionSet,
    /// Criticality of the owning application.
    pub criticality: Criticality,
}

impl PolicyFacts {
    #[must_use]
    pub fn new(policy: Policy, vocabulary: &Vocabulary, criticality: Criticality) -> Self {
        Self {
            resource_key: vocabulary.resource_key(&policy.resource),
            action: vocabulary.action(&policy.action),
            subject: SubjectScope::parse(&policy.subject, vocabulary),
            conditions: ConditionSet::parse(policy.conditions.as_deref()),
            criticality,
            policy,
        }
    }

    /// No subject check and no conditions.
    #[must_use]
    pub fn is_unguarded(&self) -> bool {
        self.subject.is_anyone() && self.conditions.is_empty()
    }

    /// Stable fingerprint of what this policy requires, independent of the
    /// owning application and of surface spelling.
    #[must_use]
    pub fn requirement_fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.action.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.subject.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.conditions.canonical().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.policy.effect.to_string().as_bytes());
        hasher.finalize().to_hex()[..16].to_string()
    }
}

/// Identifies a bucket.
///
/// Cross-application indexes bucket on the resource alone; intra-application
/// indexes also partition by owning application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockingKey {
    pub resource_type: String,
    pub application_id: Option<ApplicationId>,
}

impl fmt::Display for BlockingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.application_id {
            Some(app) => write!(f, "{}@{}", self.resource_type, app),
            None => write!(f, "{}", self.resource_type),
        }
    }
}

/// A bucket of arena indices sharing a blocking key.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub key: BlockingKey,
    pub members: Vec<usize>,
}

/// Policies grouped for pair generation.
#[derive(Debug, Clone)]
pub struct PolicyIndex {
    mode: ConflictScope,
    arena: Vec<PolicyFacts>,
    by_id: HashMap<PolicyId, usize>,
    buckets: Vec<Bucket>,
}

impl PolicyIndex {
    /// Builds the index.
    ///
    /// Inactive policies are skipped, as are policies without an owning
    /// application in cross-application mode. Duplicate ids keep the first
    /// occurrence.
    pub fn build<I, F>(policies: I, mode: ConflictScope, vocabulary: &Vocabulary, criticality: F) -> Self
    where
        I: IntoIterator<Item = Policy>,
        F: Fn(Option<&ApplicationId>) -> Criticality,
    {
        let mut arena = Vec::new();
        let mut by_id = HashMap::new();
        let mut grouped: BTreeMap<BlockingKey, Vec<usize>> = BTreeMap::new();
        let mut skipped = 0usize;

        for policy in policies {
            if !policy.is_active()
                || by_id.contains_key(&policy.id)
                || (mode == ConflictScope::CrossApplication && policy.application_id.is_none())
            {
                skipped += 1;
                continue;
            }
            let level = criticality(policy.application_id.as_ref());
            let facts = PolicyFacts::new(policy, vocabulary, level);
            let key = BlockingKey {
                resource_type: facts.resource_key.clone(),
                application_id: match mode {
                    ConflictScope::IntraApplication => facts.policy.application_id.clone(),
                    ConflictScope::CrossApplication => None,
                },
            };
            let idx = arena.len();
            by_id.insert(facts.policy.id, idx);
            arena.push(facts);
            grouped.entry(key).or_default().push(idx);
        }

        let buckets: Vec<Bucket> = grouped
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(key, members)| Bucket { key, members })
            .collect();

        debug!(
            policies = arena.len(),
            skipped,
            buckets = buckets.len(),
            "policy index built"
        );

        Self {
            mode,
            arena,
            by_id,
            buckets,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ConflictScope {
        self.mode
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    #[must_use]
    pub fn facts(&self, idx: usize) -> Option<&PolicyFacts> {
        self.arena.get(idx)
    }

    #[must_use]
    pub fn get(&self, id: PolicyId) -> Option<&PolicyFacts> {
        self.by_id.get(&id).and_then(|idx| self.arena.get(*idx))
    }

    /// Buckets with at least two members.
    #[must_use]
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Distinct resource types present in the index.
    #[must_use]
    pub fn resource_types(&self) -> BTreeSet<&str> {
        self.arena.iter().map(|f| f.resource_key.as_str()).collect()
    }

    /// Upper bound on candidate pairs before application filtering.
    #[must_use]
    pub fn candidate_upper_bound(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.members.len() * (b.members.len() - 1) / 2)
            .sum()
    }
}
