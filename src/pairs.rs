//! Candidate pair generation within buckets.

use std::collections::BTreeSet;

use tracing::warn;

use crate::application::ApplicationId;
use crate::conflict::{ConflictScope, PairKey};
use crate::index::{Bucket, PolicyFacts, PolicyIndex};
use crate::storage::ConflictStore;

/// Two policies to classify, in canonical (lower id first) order.
#[derive(Debug, Clone, Copy)]
pub struct CandidatePair<'a> {
    pub a: &'a PolicyFacts,
    pub b: &'a PolicyFacts,
    pub scope: ConflictScope,
    pub key: PairKey,
}

/// Produces candidate pairs from an index.
///
/// Each unordered pair is yielded at most once per run. In cross-application
/// mode pairs from the same application are skipped. Pairs that already have
/// a pending conflict of the same scope are skipped when a conflict store is
/// attached.
#[derive(Clone, Copy)]
pub struct PairGenerator<'a> {
    index: &'a PolicyIndex,
    applications: Option<&'a BTreeSet<ApplicationId>>,
    existing: Option<&'a dyn ConflictStore>,
}

impl<'a> PairGenerator<'a> {
    #[must_use]
    pub fn new(index: &'a PolicyIndex) -> Self {
        Self {
            index,
            applications: None,
            existing: None,
        }
    }

    /// Restricts pairs to policies owned by the given applications.
    #[must_use]
    pub fn with_applications(mut self, applications: Option<&'a BTreeSet<ApplicationId>>) -> Self {
        self.applications = applications;
        self
    }

    /// Skips pairs that already have a pending conflict in `store`.
    #[must_use]
    pub fn with_existing(mut self, store: &'a dyn ConflictStore) -> Self {
        self.existing = Some(store);
        self
    }

    /// Lazily enumerates the pairs of one bucket.
    #[must_use]
    pub fn bucket(&self, bucket: &'a Bucket) -> BucketPairs<'a> {
        BucketPairs {
            generator: *self,
            members: &bucket.members,
            i: 0,
            j: 1,
            skipped_existing: 0,
        }
    }

    /// Enumerates the pairs of every bucket.
    pub fn all(&self) -> impl Iterator<Item = CandidatePair<'a>> + 'a {
        let generator = *self;
        let index: &'a PolicyIndex = self.index;
        index.buckets().iter().flat_map(move |b| generator.bucket(b))
    }

    fn in_scope(&self, facts: &PolicyFacts) -> bool {
        match self.applications {
            None => true,
            Some(apps) => facts
                .policy
                .application_id
                .as_ref()
                .is_some_and(|id| apps.contains(id)),
        }
    }

    fn pair(&self, x: &'a PolicyFacts, y: &'a PolicyFacts) -> Option<CandidatePair<'a>> {
        if !self.in_scope(x) || !self.in_scope(y) {
            return None;
        }
        let scope = self.index.mode();
        if scope == ConflictScope::CrossApplication && x.policy.application_id == y.policy.application_id {
            return None;
        }
        let key = PairKey::new(x.policy.id, y.policy.id).ok()?;
        let (a, b) = if key.first() == x.policy.id { (x, y) } else { (y, x) };
        Some(CandidatePair { a, b, scope, key })
    }
}

/// Iterator over the pairs of one bucket.
pub struct BucketPairs<'a> {
    generator: PairGenerator<'a>,
    members: &'a [usize],
    i: usize,
    j: usize,
    skipped_existing: usize,
}

impl BucketPairs<'_> {
    /// Pairs skipped so far because a pending conflict already covers them.
    #[must_use]
    pub fn skipped_existing(&self) -> usize {
        self.skipped_existing
    }

    fn already_flagged(&self, pair: &CandidatePair<'_>) -> bool {
        let Some(store) = self.generator.existing else {
            return false;
        };
        match store.find_pending(pair.key, pair.scope) {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(pair = %pair.key, error = %e, "existing-conflict lookup failed");
                false
            }
        }
    }
}

impl<'a> Iterator for BucketPairs<'a> {
    type Item = CandidatePair<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.generator.index;
        while self.i + 1 < self.members.len() {
            if self.j >= self.members.len() {
                self.i += 1;
                self.j = self.i + 1;
                continue;
            }
            let (i, j) = (self.members[self.i], self.members[self.j]);
            self.j += 1;

            let (Some(x), Some(y)) = (index.facts(i), index.facts(j)) else {
                continue;
            };
            let Some(pair) = self.generator.pair(x, y) else {
                continue;
            };
            if self.already_flagged(&pair) {
                self.skipped_existing += 1;
                continue;
            }
            return Some(pair);
        }
        None
    }
}
