//! Pair classification.
//!
//! [`RuleClassifier`] decides what it can from normalized policy facts.
//! [`Classifier`] wraps it with the recommendation adapter: undecided pairs
//! are sent to the service, and decided ones are optionally explained.

mod conditions;
mod rules;
mod scope;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::advisor::{Evidence, PolicySummary, RecommendationAdapter};
use crate::conflict::{ConflictScope, ConflictType};
use crate::pairs::CandidatePair;
use crate::policy::PolicyTemplate;
use crate::severity::Severity;

pub use conditions::{ConditionSet, FieldConstraint, Interval, TextSet};
pub use rules::RuleClassifier;
pub use scope::SubjectScope;

/// How one set of requests relates to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Equal,
    /// Strict subset.
    Narrower,
    /// Strict superset.
    Broader,
    /// Intersecting, neither contains the other.
    Overlap,
    Disjoint,
    /// Could not be determined.
    Unknown,
}

impl Relation {
    /// The relation from the other side's point of view.
    #[must_use]
    pub const fn inverse(self) -> Self {
        match self {
            Self::Narrower => Self::Broader,
            Self::Broader => Self::Narrower,
            other => other,
        }
    }

    /// Combines relations over independent dimensions (the sets are
    /// cartesian products, so one disjoint dimension makes them disjoint).
    #[must_use]
    pub const fn meet(self, other: Self) -> Self {
        match (self, other) {
            (Self::Disjoint, _) | (_, Self::Disjoint) => Self::Disjoint,
            (Self::Unknown, _) | (_, Self::Unknown) => Self::Unknown,
            (Self::Equal, x) | (x, Self::Equal) => x,
            (Self::Narrower, Self::Narrower) => Self::Narrower,
            (Self::Broader, Self::Broader) => Self::Broader,
            _ => Self::Overlap,
        }
    }

    /// Relation between two finite sets.
    #[must_use]
    pub fn of_sets<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> Self {
        if a == b {
            Self::Equal
        } else if a.is_subset(b) {
            Self::Narrower
        } else if a.is_superset(b) {
            Self::Broader
        } else if a.is_disjoint(b) {
            Self::Disjoint
        } else {
            Self::Overlap
        }
    }
}

/// The outcome of classifying one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    NoConflict {
        reason: &'static str,
    },
    Conflict {
        conflict_type: ConflictType,
        severity: Severity,
        description: String,
    },
    /// The rules cannot decide; the recommendation service is consulted.
    Undetermined {
        reason: String,
    },
}

impl Verdict {
    #[must_use]
    pub const fn no_conflict(reason: &'static str) -> Self {
        Self::NoConflict { reason }
    }

    #[must_use]
    pub fn conflict(conflict_type: ConflictType, severity: Severity, description: String) -> Self {
        Self::Conflict {
            conflict_type,
            severity: severity.pairwise(),
            description,
        }
    }

    #[must_use]
    pub fn undetermined(reason: impl Into<String>) -> Self {
        Self::Undetermined { reason: reason.into() }
    }
}

/// Decides whether a candidate pair conflicts.
///
/// Implementations must be symmetric: swapping the two policies of a pair
/// may not change the verdict's type or severity.
pub trait PairClassifier: Send + Sync {
    fn classify(&self, pair: &CandidatePair<'_>) -> Verdict;
}

/// A conflict ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedPair {
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub description: String,
    pub explanation: Option<String>,
    pub suggested_policy: Option<PolicyTemplate>,
    /// Set when the service was needed to classify the pair and did not answer.
    pub degraded: bool,
}

impl ClassifiedPair {
    #[must_use]
    pub fn is_explained(&self) -> bool {
        self.explanation.is_some()
    }
}

/// Rules followed by the recommendation adapter.
#[derive(Clone)]
pub struct Classifier {
    rules: Arc<dyn PairClassifier>,
    advisor: RecommendationAdapter,
    explain: bool,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("advisor", &self.advisor)
            .field("explain", &self.explain)
            .finish_non_exhaustive()
    }
}

impl Classifier {
    #[must_use]
    pub fn new(rules: Arc<dyn PairClassifier>, advisor: RecommendationAdapter, explain: bool) -> Self {
        Self { rules, advisor, explain }
    }

    /// Classifies a pair; `None` means no conflict.
    #[must_use]
    pub fn classify(&self, pair: &CandidatePair<'_>) -> Option<ClassifiedPair> {
        match self.rules.classify(pair) {
            Verdict::NoConflict { reason } => {
                debug!(pair = %pair.key, reason, "no conflict");
                None
            }
            Verdict::Conflict {
                conflict_type,
                severity,
                description,
            } => {
                let mut classified = ClassifiedPair {
                    conflict_type,
                    severity,
                    description,
                    explanation: None,
                    suggested_policy: None,
                    degraded: false,
                };
                if self.explain && self.advisor.is_enabled() {
                    match self.advisor.request(evidence(pair, Some(conflict_type))) {
                        Ok(advice) => {
                            classified.explanation = Some(advice.explanation).filter(|e| !e.is_empty());
                            classified.suggested_policy = advice.recommended_policy;
                        }
                        Err(e) => warn!(pair = %pair.key, error = %e, "conflict left unexplained"),
                    }
                }
                Some(classified)
            }
            Verdict::Undetermined { reason } => self.consult(pair, &reason),
        }
    }

    fn consult(&self, pair: &CandidatePair<'_>, reason: &str) -> Option<ClassifiedPair> {
        match self.advisor.request(evidence(pair, None)) {
            Ok(advice) => {
                let conflict_type = advice.classification?;
                let conflict_type = match (conflict_type, pair.scope) {
                    (ConflictType::Inconsistent, ConflictScope::IntraApplication) => ConflictType::Overlapping,
                    (other, _) => other,
                };
                Some(ClassifiedPair {
                    conflict_type,
                    severity: advice.severity.unwrap_or(Severity::Medium).pairwise(),
                    description: format!("{reason}; classified by the recommendation service"),
                    explanation: Some(advice.explanation).filter(|e| !e.is_empty()),
                    suggested_policy: advice.recommended_policy,
                    degraded: false,
                })
            }
            Err(e) => {
                warn!(pair = %pair.key, error = %e, "flagging undetermined pair for review");
                let conflict_type = match pair.scope {
                    ConflictScope::IntraApplication => ConflictType::Overlapping,
                    ConflictScope::CrossApplication => ConflictType::Inconsistent,
                };
                Some(ClassifiedPair {
                    conflict_type,
                    severity: Severity::Low,
                    description: format!("Needs review: {reason} ({e})"),
                    explanation: None,
                    suggested_policy: None,
                    degraded: true,
                })
            }
        }
    }
}

fn evidence(pair: &CandidatePair<'_>, rule_verdict: Option<ConflictType>) -> Evidence {
    Evidence::Pair {
        scope: pair.scope,
        rule_verdict,
        policies: [
            PolicySummary::from(&pair.a.policy),
            PolicySummary::from(&pair.b.policy),
        ],
    }
}
