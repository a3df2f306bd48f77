//! Group aggregation of cross-application inconsistencies.
//!
//! Pending `inconsistent` cross-application conflicts are edges between
//! policies. Within one resource type, the connected components of that
//! graph are the groups of applications enforcing the same access
//! differently. Each component spanning two or more applications becomes a
//! single [`InconsistentEnforcement`], or is folded into the open one that
//! already exists for the resource type.
//!
//! Runs single-threaded after every classification worker has finished.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::advisor::{Evidence, PolicySummary, RecommendationAdapter};
use crate::application::{ApplicationId, Criticality};
use crate::conflict::{Conflict, ConflictId, ConflictScope, ConflictStatus, ConflictType};
use crate::error::{AccordResult, AdvisorError};
use crate::inconsistency::{InconsistencyId, InconsistentEnforcement};
use crate::index::PolicyFacts;
use crate::normalize::Vocabulary;
use crate::policy::{Policy, PolicyId, PolicyTemplate};
use crate::severity::Severity;
use crate::storage::{ConflictFilter, ConflictStore, InconsistencyFilter, InconsistencyStore, PolicyStore};

/// Disjoint-set forest with union by rank and path halving.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merges the sets of `a` and `b`. Returns false if they were already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }

    /// Groups every element by its root, in ascending element order.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for x in 0..self.parent.len() {
            let root = self.find(x);
            by_root.entry(root).or_default().push(x);
        }
        by_root.into_values().collect()
    }
}

/// What one aggregation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationOutcome {
    pub created: Vec<InconsistencyId>,
    pub updated: Vec<InconsistencyId>,
    /// Groups recorded with the fallback recommendation.
    pub unexplained: usize,
    /// One message per group or resource type that could not be processed.
    pub failures: Vec<String>,
}

/// One connected component of live inconsistent edges.
struct Component {
    members: Vec<PolicyFacts>,
    conflict_ids: BTreeSet<ConflictId>,
    edge_severity: Severity,
}

impl Component {
    fn applications(&self) -> BTreeSet<ApplicationId> {
        self.members
            .iter()
            .filter_map(|f| f.policy.application_id.clone())
            .collect()
    }

    fn actions(&self) -> BTreeSet<String> {
        self.members.iter().map(|f| f.action.clone()).collect()
    }
}

/// Live edges and settled conflict IDs, keyed by resource type.
#[derive(Default)]
struct EdgeScan {
    edges: HashMap<String, Vec<Conflict>>,
    settled: HashMap<String, BTreeSet<ConflictId>>,
}

/// Number of distinct requirements among `members`.
fn variant_count(members: &[PolicyFacts]) -> usize {
    members
        .iter()
        .map(PolicyFacts::requirement_fingerprint)
        .collect::<BTreeSet<_>>()
        .len()
}

/// Group severity: the strongest edge, escalated once for three or more
/// variants or a critical application.
fn group_severity(edge_severity: Severity, members: &[PolicyFacts]) -> Severity {
    let critical = members.iter().any(|f| f.criticality == Criticality::Critical);
    if critical || variant_count(members) >= 3 {
        edge_severity.escalate()
    } else {
        edge_severity
    }
}

/// The most restrictive existing requirement: an explicit subject over none,
/// then fewer roles, then more constraints.
fn most_restrictive(members: &[PolicyFacts]) -> Option<&PolicyFacts> {
    members.iter().min_by_key(|f| {
        (
            f.subject.is_anyone(),
            f.subject.role_count(),
            Reverse(f.conditions.constraint_count()),
            f.requirement_fingerprint(),
        )
    })
}

fn describe(resource_type: &str, applications: usize, actions: &BTreeSet<String>, variants: usize) -> String {
    let actions: Vec<&str> = actions.iter().map(String::as_str).collect();
    format!(
        "{applications} applications enforce {} on {resource_type} with {variants} different requirement(s)",
        actions.join("/")
    )
}

fn group_evidence(resource_type: &str, members: &[PolicyFacts]) -> Evidence {
    let actions: BTreeSet<String> = members.iter().map(|f| f.action.clone()).collect();
    Evidence::Group {
        resource_type: resource_type.to_string(),
        actions: actions.into_iter().collect(),
        variants: variant_count(members),
        policies: members.iter().map(|f| PolicySummary::from(&f.policy)).collect(),
    }
}

/// Collapses inconsistent edges into group findings.
pub struct GroupAggregator<'a> {
    policies: &'a dyn PolicyStore,
    conflicts: &'a dyn ConflictStore,
    inconsistencies: &'a dyn InconsistencyStore,
    advisor: &'a RecommendationAdapter,
    vocabulary: &'a Vocabulary,
    criticality: Option<&'a BTreeMap<ApplicationId, Criticality>>,
}

impl<'a> GroupAggregator<'a> {
    #[must_use]
    pub fn new(
        policies: &'a dyn PolicyStore,
        conflicts: &'a dyn ConflictStore,
        inconsistencies: &'a dyn InconsistencyStore,
        advisor: &'a RecommendationAdapter,
        vocabulary: &'a Vocabulary,
    ) -> Self {
        Self {
            policies,
            conflicts,
            inconsistencies,
            advisor,
            vocabulary,
            criticality: None,
        }
    }

    /// Criticality per application; unlisted applications are standard.
    #[must_use]
    pub fn with_criticality(mut self, criticality: &'a BTreeMap<ApplicationId, Criticality>) -> Self {
        self.criticality = Some(criticality);
        self
    }

    fn criticality_of(&self, application_id: Option<&ApplicationId>) -> Criticality {
        application_id
            .and_then(|id| self.criticality.and_then(|m| m.get(id).copied()))
            .unwrap_or_default()
    }

    /// Aggregates every listed resource type that has pending inconsistent
    /// edges. Failures are collected per group and never abort the pass.
    pub fn run<'r, I>(&self, resource_types: I) -> AggregationOutcome
    where
        I: IntoIterator<Item = &'r str>,
    {
        let mut outcome = AggregationOutcome::default();
        let EdgeScan { mut edges, mut settled } = match self.load_edges() {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "could not load inconsistent edges");
                outcome.failures.push(format!("edge scan: {e}"));
                return outcome;
            }
        };
        for resource_type in resource_types {
            let Some(edges) = edges.remove(resource_type) else {
                continue;
            };
            let settled = settled.remove(resource_type).unwrap_or_default();
            if let Err(e) = self.aggregate_resource_type(resource_type, &edges, &settled, &mut outcome) {
                warn!(resource_type, error = %e, "aggregation failed");
                outcome.failures.push(format!("{resource_type}: {e}"));
            }
        }
        if !outcome.created.is_empty() || !outcome.updated.is_empty() {
            info!(
                created = outcome.created.len(),
                updated = outcome.updated.len(),
                unexplained = outcome.unexplained,
                "inconsistent enforcement aggregated"
            );
        }
        outcome
    }

    /// One read of each store: pending cross-application inconsistent edges,
    /// and the conflicts already covered by a dismissed or resolved finding,
    /// both keyed by resource type.
    fn load_edges(&self) -> AccordResult<EdgeScan> {
        let filter = ConflictFilter {
            status: Some(ConflictStatus::Pending),
            scope: Some(ConflictScope::CrossApplication),
            conflict_type: Some(ConflictType::Inconsistent),
            ..ConflictFilter::default()
        };
        let mut edges: HashMap<String, Vec<Conflict>> = HashMap::new();
        for conflict in self.conflicts.list(&filter)? {
            edges.entry(conflict.resource_type.clone()).or_default().push(conflict);
        }
        if edges.is_empty() {
            return Ok(EdgeScan::default());
        }

        let mut settled: HashMap<String, BTreeSet<ConflictId>> = HashMap::new();
        for finding in self.inconsistencies.list(&InconsistencyFilter::default())? {
            if !finding.is_open() && edges.contains_key(&finding.resource_type) {
                settled
                    .entry(finding.resource_type)
                    .or_default()
                    .extend(finding.conflict_ids);
            }
        }
        Ok(EdgeScan { edges, settled })
    }

    fn aggregate_resource_type(
        &self,
        resource_type: &str,
        edges: &[Conflict],
        settled: &BTreeSet<ConflictId>,
        outcome: &mut AggregationOutcome,
    ) -> AccordResult<()> {
        for component in self.components(edges)? {
            if component.applications().len() < 2 || component.conflict_ids.is_subset(settled) {
                continue;
            }
            let result = match self.open_finding(resource_type)? {
                Some(existing) => self.fold_into(existing, &component, outcome),
                None => self.create(resource_type, &component, outcome),
            };
            if let Err(e) = result {
                warn!(resource_type, error = %e, "group finding not recorded");
                outcome.failures.push(format!("{resource_type}: {e}"));
            }
        }
        Ok(())
    }

    /// Builds connected components over edges whose endpoints are both active.
    fn components(&self, edges: &[Conflict]) -> AccordResult<Vec<Component>> {
        let mut facts: HashMap<PolicyId, Option<PolicyFacts>> = HashMap::new();
        let mut live: Vec<&Conflict> = Vec::with_capacity(edges.len());
        for edge in edges {
            let mut both = true;
            for id in [edge.policy_a_id, edge.policy_b_id] {
                if !facts.contains_key(&id) {
                    let loaded = self.active_facts(id)?;
                    facts.insert(id, loaded);
                }
                both &= facts.get(&id).is_some_and(Option::is_some);
            }
            if both {
                live.push(edge);
            } else {
                debug!(conflict = %edge.id, "skipping edge with a retired endpoint");
            }
        }

        let ids: Vec<PolicyId> = live
            .iter()
            .flat_map(|e| [e.policy_a_id, e.policy_b_id])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let position: HashMap<PolicyId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut forest = UnionFind::new(ids.len());
        for edge in &live {
            forest.union(position[&edge.policy_a_id], position[&edge.policy_b_id]);
        }

        let mut components = Vec::new();
        for group in forest.components() {
            let members: BTreeSet<PolicyId> = group.iter().map(|&i| ids[i]).collect();
            let mut conflict_ids = BTreeSet::new();
            let mut edge_severity = Severity::Low;
            for edge in live.iter().filter(|e| members.contains(&e.policy_a_id)) {
                conflict_ids.insert(edge.id);
                edge_severity = edge_severity.max(edge.severity);
            }
            components.push(Component {
                members: members
                    .iter()
                    .filter_map(|id| facts.get(id).cloned().flatten())
                    .collect(),
                conflict_ids,
                edge_severity,
            });
        }
        Ok(components)
    }

    fn active_facts(&self, id: PolicyId) -> AccordResult<Option<PolicyFacts>> {
        Ok(self.policies.get(id)?.filter(Policy::is_active).map(|p| {
            let criticality = self.criticality_of(p.application_id.as_ref());
            PolicyFacts::new(p, self.vocabulary, criticality)
        }))
    }

    /// The oldest open finding for the resource type.
    fn open_finding(&self, resource_type: &str) -> AccordResult<Option<InconsistentEnforcement>> {
        let mut open = self.inconsistencies.find_open_by_resource_type(resource_type)?;
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(open.into_iter().next())
    }

    /// Asks the service for one recommendation covering the whole group.
    fn recommend(&self, resource_type: &str, members: &[PolicyFacts]) -> Result<(PolicyTemplate, String), AdvisorError> {
        let advice = self.advisor.request(group_evidence(resource_type, members))?;
        let template = match advice.recommended_policy {
            Some(t) => t,
            None => fallback_template(members)?,
        };
        Ok((template, advice.explanation))
    }

    fn create(&self, resource_type: &str, component: &Component, outcome: &mut AggregationOutcome) -> AccordResult<()> {
        let members = &component.members;
        let applications = component.applications();
        let actions = component.actions();
        let variants = variant_count(members);
        let severity = group_severity(component.edge_severity, members);

        let (template, explanation, explained) = match self.recommend(resource_type, members) {
            Ok((template, explanation)) => (template, explanation, true),
            Err(e) => {
                warn!(resource_type, error = %e, "group recommendation degraded");
                outcome.unexplained += 1;
                (
                    fallback_template(members)?,
                    format!("Recommendation service unavailable ({e}); proposing the most restrictive existing requirement"),
                    false,
                )
            }
        };

        let finding = InconsistentEnforcement::new(
            resource_type,
            actions.clone(),
            applications.clone(),
            members.iter().map(|f| f.policy.id).collect(),
            component.conflict_ids.clone(),
            describe(resource_type, applications.len(), &actions, variants),
            severity,
            template,
            explanation,
            explained,
        );
        let policies: Vec<Policy> = members.iter().map(|f| f.policy.clone()).collect();
        finding.validate(&policies)?;
        let id = finding.id;
        self.inconsistencies.insert(finding)?;
        info!(
            inconsistency = %id,
            resource_type,
            applications = applications.len(),
            variants,
            %severity,
            "inconsistent enforcement recorded"
        );
        outcome.created.push(id);
        Ok(())
    }

    fn fold_into(
        &self,
        mut finding: InconsistentEnforcement,
        component: &Component,
        outcome: &mut AggregationOutcome,
    ) -> AccordResult<()> {
        let incoming = InconsistentEnforcement::new(
            finding.resource_type.clone(),
            component.actions(),
            component.applications(),
            component.members.iter().map(|f| f.policy.id).collect(),
            component.conflict_ids.clone(),
            String::new(),
            component.edge_severity,
            finding.recommended_policy.clone(),
            String::new(),
            finding.explained,
        );
        if !finding.absorb(&incoming) {
            debug!(inconsistency = %finding.id, "group already covered");
            return Ok(());
        }

        let mut policies = Vec::with_capacity(finding.policy_ids.len());
        let mut members = Vec::with_capacity(finding.policy_ids.len());
        for id in &finding.policy_ids {
            if let Some(p) = self.policies.get(*id)? {
                if p.is_active() {
                    let criticality = self.criticality_of(p.application_id.as_ref());
                    members.push(PolicyFacts::new(p.clone(), self.vocabulary, criticality));
                }
                policies.push(p);
            }
        }
        finding.validate(&policies)?;

        let variants = variant_count(&members);
        finding.severity = finding.severity.max(group_severity(component.edge_severity, &members));
        finding.inconsistency_description = describe(
            &finding.resource_type,
            finding.affected_application_ids.len(),
            &finding.actions,
            variants,
        );
        match self.recommend(&finding.resource_type, &members) {
            Ok((template, explanation)) => {
                finding.recommended_policy = template;
                finding.recommendation_explanation = explanation;
                finding.explained = true;
            }
            Err(e) => {
                warn!(inconsistency = %finding.id, error = %e, "keeping previous recommendation");
                outcome.unexplained += 1;
            }
        }
        finding.touch(Utc::now());

        let id = finding.id;
        self.inconsistencies.update(finding)?;
        info!(inconsistency = %id, variants, "inconsistent enforcement widened");
        outcome.updated.push(id);
        Ok(())
    }
}

fn fallback_template(members: &[PolicyFacts]) -> Result<PolicyTemplate, AdvisorError> {
    most_restrictive(members)
        .map(|f| f.policy.template())
        .ok_or_else(|| AdvisorError::InvalidResponse {
            reason: "group has no active members".to_string(),
        })
}
