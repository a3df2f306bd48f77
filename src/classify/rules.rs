//! Deterministic pair classification rules.

use crate::application::Criticality;
use crate::conflict::{ConflictScope, ConflictType};
use crate::index::PolicyFacts;
use crate::pairs::CandidatePair;
use crate::severity::{RiskLevel, Severity};

use super::{PairClassifier, Relation, Verdict};

/// Classifies pairs from their normalized subject scopes and conditions.
///
/// Rule order:
/// 1. different resource or action never conflicts;
/// 2. opposite effects on intersecting inputs are contradictory;
/// 3. identical subjects with complementary conditions are contradictory;
/// 4. across applications, any other difference in requirements is
///    inconsistent enforcement;
/// 5. within an application, intersecting but unequal requirements overlap.
///
/// Whenever the answer hinges on a condition it cannot interpret, the pair
/// is reported as undetermined.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl PairClassifier for RuleClassifier {
    fn classify(&self, pair: &CandidatePair<'_>) -> Verdict {
        let (a, b) = (pair.a, pair.b);
        if a.resource_key != b.resource_key || a.action != b.action {
            return Verdict::no_conflict("different resource or action");
        }

        let subjects = a.subject.relation(&b.subject);
        let conditions = a.conditions.relation(&b.conditions);
        let describe = |headline: &str| {
            format!(
                "{headline}: [{}] {} vs [{}] {}",
                owner(a),
                a.policy.template(),
                owner(b),
                b.policy.template()
            )
        };

        if a.policy.effect != b.policy.effect {
            if subjects == Relation::Disjoint || conditions == Relation::Disjoint {
                return Verdict::no_conflict("opposite effects on disjoint requests");
            }
            if conditions == Relation::Unknown {
                return Verdict::undetermined("opposite effects under conditions that cannot be compared");
            }
            return Verdict::conflict(
                ConflictType::Contradictory,
                contradiction_severity(a, b),
                describe("Opposite effects for the same request"),
            );
        }

        if subjects == Relation::Equal && a.conditions.complements(&b.conditions) {
            return Verdict::conflict(
                ConflictType::Contradictory,
                contradiction_severity(a, b),
                describe("Mutually exclusive conditions for the same subject"),
            );
        }

        let same_requirements = subjects == Relation::Equal && conditions == Relation::Equal;

        match pair.scope {
            ConflictScope::CrossApplication => {
                if same_requirements {
                    return Verdict::no_conflict("enforced identically");
                }
                if conditions == Relation::Unknown {
                    return Verdict::undetermined("requirements differ under conditions that cannot be compared");
                }
                Verdict::conflict(
                    ConflictType::Inconsistent,
                    inconsistency_severity(a, b),
                    describe("Different requirements across applications"),
                )
            }
            ConflictScope::IntraApplication => {
                if same_requirements {
                    return Verdict::no_conflict("duplicate rule");
                }
                if subjects == Relation::Disjoint {
                    return Verdict::no_conflict("disjoint subjects");
                }
                if conditions == Relation::Disjoint {
                    return Verdict::no_conflict("disjoint conditions");
                }
                if conditions == Relation::Unknown {
                    return Verdict::undetermined("overlap depends on conditions that cannot be compared");
                }
                let severity = match subjects.meet(conditions) {
                    Relation::Narrower | Relation::Broader => Severity::Low,
                    _ => Severity::Medium,
                };
                Verdict::conflict(
                    ConflictType::Overlapping,
                    severity,
                    describe("Redundant or overlapping rules"),
                )
            }
        }
    }
}

fn owner(facts: &PolicyFacts) -> &str {
    facts
        .policy
        .application_id
        .as_ref()
        .map_or("unassigned", |id| id.as_str())
}

fn either_high_risk(a: &PolicyFacts, b: &PolicyFacts) -> bool {
    a.policy.risk_level == RiskLevel::High || b.policy.risk_level == RiskLevel::High
}

fn contradiction_severity(a: &PolicyFacts, b: &PolicyFacts) -> Severity {
    if either_high_risk(a, b) {
        Severity::High
    } else {
        Severity::Medium
    }
}

/// Medium by default. An unguarded side or high policy risk raises it to
/// high, as does a high-criticality application; pairs never exceed high.
fn inconsistency_severity(a: &PolicyFacts, b: &PolicyFacts) -> Severity {
    let mut severity = Severity::Medium;
    if a.is_unguarded() || b.is_unguarded() || either_high_risk(a, b) {
        severity = Severity::High;
    }
    if a.criticality.max(b.criticality) >= Criticality::High {
        severity = severity.escalate();
    }
    severity.pairwise()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::conflict::PairKey;
    use crate::normalize::Vocabulary;
    use crate::policy::{Effect, Policy};

    fn facts(app: &str, subject: &str, conditions: Option<&str>, effect: Effect) -> PolicyFacts {
        let mut builder = Policy::builder()
            .application(app)
            .subject(subject)
            .resource("ExpenseReport")
            .action("approve")
            .effect(effect);
        if let Some(c) = conditions {
            builder = builder.conditions(c);
        }
        PolicyFacts::new(builder.build().unwrap(), &Vocabulary::default(), Criticality::Standard)
    }

    fn classify(a: &PolicyFacts, b: &PolicyFacts, scope: ConflictScope) -> Verdict {
        let pair = CandidatePair {
            a,
            b,
            scope,
            key: PairKey::new(a.policy.id, b.policy.id).unwrap(),
        };
        RuleClassifier.classify(&pair)
    }

    fn kind(verdict: &Verdict) -> Option<(ConflictType, Severity)> {
        match verdict {
            Verdict::Conflict { conflict_type, severity, .. } => Some((*conflict_type, *severity)),
            _ => None,
        }
    }

    #[test]
    fn test_opposite_effects_contradict() {
        let a = facts("app1", "Manager", Some("amount < 5000"), Effect::Allow);
        let b = facts("app1", "Manager", Some("amount < 5000"), Effect::Deny);
        let v = classify(&a, &b, ConflictScope::IntraApplication);
        assert_eq!(kind(&v), Some((ConflictType::Contradictory, Severity::Medium)));
    }

    #[test]
    fn test_complementary_conditions_contradict() {
        let a = facts("app1", "Manager", Some("amount < 5000"), Effect::Allow);
        let b = facts("app1", "Manager", Some("amount >= 5000"), Effect::Allow);
        let v = classify(&a, &b, ConflictScope::IntraApplication);
        assert_eq!(kind(&v).map(|k| k.0), Some(ConflictType::Contradictory));
    }

    #[test]
    fn test_overlap_with_dominance_is_low() {
        let a = facts("app1", "Manager", Some("amount < 5000"), Effect::Allow);
        let b = facts("app1", "Manager or Director", Some("amount < 10000"), Effect::Allow);
        let v = classify(&a, &b, ConflictScope::IntraApplication);
        assert_eq!(kind(&v), Some((ConflictType::Overlapping, Severity::Low)));
    }

    #[test]
    fn test_partial_overlap_is_medium() {
        let a = facts("app1", "Manager or Clerk", Some("amount < 5000"), Effect::Allow);
        let b = facts("app1", "Manager or Director", Some("amount < 10000"), Effect::Allow);
        let v = classify(&a, &b, ConflictScope::IntraApplication);
        assert_eq!(kind(&v), Some((ConflictType::Overlapping, Severity::Medium)));
    }

    #[test]
    fn test_disjoint_subjects_do_not_conflict() {
        let a = facts("app1", "Manager", None, Effect::Allow);
        let b = facts("app1", "Clerk", None, Effect::Deny);
        assert!(matches!(
            classify(&a, &b, ConflictScope::IntraApplication),
            Verdict::NoConflict { .. }
        ));
    }

    #[test]
    fn test_duplicates_do_not_conflict() {
        let a = facts("app1", "Manager", None, Effect::Allow);
        let b = facts("app2", "manager", None, Effect::Allow);
        assert!(matches!(
            classify(&a, &b, ConflictScope::CrossApplication),
            Verdict::NoConflict { .. }
        ));
    }

    #[test]
    fn test_cross_application_difference_is_inconsistent() {
        let a = facts("app1", "Admin", None, Effect::Allow);
        let b = facts("app2", "", None, Effect::Allow);
        let v = classify(&a, &b, ConflictScope::CrossApplication);
        assert_eq!(kind(&v), Some((ConflictType::Inconsistent, Severity::High)));

        let c = facts("app3", "Admin", Some("mfa == true"), Effect::Allow);
        let v = classify(&a, &c, ConflictScope::CrossApplication);
        assert_eq!(kind(&v), Some((ConflictType::Inconsistent, Severity::Medium)));
    }

    #[test]
    fn test_critical_application_raises_pair_severity() {
        let a = facts("app1", "Admin", None, Effect::Allow);
        let mut c = facts("app3", "Admin", Some("mfa == true"), Effect::Allow);
        c.criticality = Criticality::Critical;
        let v = classify(&a, &c, ConflictScope::CrossApplication);
        assert_eq!(kind(&v), Some((ConflictType::Inconsistent, Severity::High)));
    }

    #[test]
    fn test_opaque_conditions_are_undetermined() {
        let a = facts("app1", "Manager", Some("request.ip in corp_range"), Effect::Allow);
        let b = facts("app1", "Manager", None, Effect::Deny);
        assert!(matches!(
            classify(&a, &b, ConflictScope::IntraApplication),
            Verdict::Undetermined { .. }
        ));
    }

    #[test]
    fn test_verdict_is_symmetric() {
        let a = facts("app1", "Manager", Some("amount < 5000"), Effect::Allow);
        let b = facts("app2", "Manager or Director", None, Effect::Allow);
        assert_eq!(
            kind(&classify(&a, &b, ConflictScope::CrossApplication)),
            kind(&classify(&b, &a, ConflictScope::CrossApplication))
        );
    }
}
