//! Striped per-policy locks.
//!
//! Resolution steps that read a policy, check it is still active and then
//! supersede it hold the stripes of every policy they touch. Stripes are
//! always taken in ascending order, so two resolutions can never deadlock.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use crate::error::{AccordError, AccordResult};
use crate::policy::PolicyId;

/// A fixed set of mutexes that policy ids hash onto.
#[derive(Debug)]
pub struct PolicyLocks {
    stripes: Vec<Mutex<()>>,
}

/// Holds the stripes of a set of policies until dropped.
#[derive(Debug)]
pub struct PolicyLockGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl PolicyLocks {
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    #[must_use]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    fn stripe_of(&self, id: PolicyId) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Locks every stripe covering `ids`.
    pub fn lock_all(&self, ids: &[PolicyId]) -> AccordResult<PolicyLockGuard<'_>> {
        let order: BTreeSet<usize> = ids.iter().map(|id| self.stripe_of(*id)).collect();
        let mut guards = Vec::with_capacity(order.len());
        for stripe in order {
            let guard = self.stripes[stripe]
                .lock()
                .map_err(|_| AccordError::internal(format!("policy lock stripe {stripe} poisoned")))?;
            guards.push(guard);
        }
        Ok(PolicyLockGuard { _guards: guards })
    }
}
