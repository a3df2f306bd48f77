//! Detection engine.
//!
//! [`DetectionEngine`] is the entry point callers use: it runs detection over
//! a scope of applications, and delegates operator decisions to the
//! [`ResolutionManager`]. A detection run is request-scoped:
//!
//! 1. load the policies in scope and build a fresh [`PolicyIndex`];
//! 2. classify every bucket on a bounded worker pool, storing each conflict
//!    as it is found (the store's pending-pair uniqueness makes concurrent
//!    runs safe);
//! 3. after all workers finish, aggregate cross-application inconsistencies
//!    into group findings.

/// Bounded worker pool and cancellation.
pub mod runtime;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::advisor::{RecommendationAdapter, RecommendationService};
use crate::aggregate::GroupAggregator;
use crate::application::{ApplicationId, Criticality};
use crate::classify::{ClassifiedPair, Classifier, PairClassifier, RuleClassifier};
use crate::config::EngineConfig;
use crate::conflict::{Conflict, ConflictId, ConflictScope, ConflictType};
use crate::error::{AccordError, AccordResult, ExecutionError};
use crate::inconsistency::{InconsistencyId, InconsistencyStatus, InconsistentEnforcement};
use crate::index::{Bucket, PolicyIndex};
use crate::normalize::Vocabulary;
use crate::pairs::{CandidatePair, PairGenerator};
use crate::resolution::{ApplyReport, Resolution, ResolutionManager};
use crate::storage::{
    ApplicationStore, ConflictFilter, ConflictStore, InMemoryStores, InconsistencyFilter, InconsistencyStore,
    PolicyStore, StorageError,
};

pub use runtime::{CancellationToken, PoolConfig};

/// The stores an engine reads and writes.
#[derive(Clone)]
pub struct EngineStores {
    pub policies: Arc<dyn PolicyStore>,
    pub applications: Arc<dyn ApplicationStore>,
    pub conflicts: Arc<dyn ConflictStore>,
    pub inconsistencies: Arc<dyn InconsistencyStore>,
}

impl EngineStores {
    /// Fresh in-memory stores.
    #[must_use]
    pub fn in_memory() -> Self {
        InMemoryStores::new().into()
    }
}

impl From<InMemoryStores> for EngineStores {
    fn from(stores: InMemoryStores) -> Self {
        Self {
            policies: Arc::new(stores.policies),
            applications: Arc::new(stores.applications),
            conflicts: Arc::new(stores.conflicts),
            inconsistencies: Arc::new(stores.inconsistencies),
        }
    }
}

impl std::fmt::Debug for EngineStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStores").finish_non_exhaustive()
    }
}

/// Which applications a detection run covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "application_ids", rename_all = "snake_case")]
pub enum DetectionScope {
    #[default]
    All,
    Applications(BTreeSet<ApplicationId>),
}

impl DetectionScope {
    /// Scope limited to the given applications.
    pub fn applications<I, A>(ids: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ApplicationId>,
    {
        Self::Applications(ids.into_iter().map(Into::into).collect())
    }

    /// The application filter, or `None` for every application.
    #[must_use]
    pub fn filter(&self) -> Option<&BTreeSet<ApplicationId>> {
        match self {
            Self::All => None,
            Self::Applications(ids) => Some(ids),
        }
    }
}

/// A finding created by a detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FindingId {
    Conflict(ConflictId),
    InconsistentEnforcement(InconsistencyId),
}

/// Findings created per type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingCounts {
    pub contradictory: usize,
    pub overlapping: usize,
    pub inconsistent: usize,
    pub inconsistent_enforcement: usize,
}

impl FindingCounts {
    fn record(&mut self, conflict_type: ConflictType) {
        match conflict_type {
            ConflictType::Contradictory => self.contradictory += 1,
            ConflictType::Overlapping => self.overlapping += 1,
            ConflictType::Inconsistent => self.inconsistent += 1,
        }
    }

    /// Pairwise conflicts created.
    #[must_use]
    pub fn conflicts(&self) -> usize {
        self.contradictory + self.overlapping + self.inconsistent
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.conflicts() + self.inconsistent_enforcement
    }
}

/// Result of one detection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub run_id: Uuid,
    pub scope: DetectionScope,
    pub cross_application: bool,
    /// No active policy matched the scope; not an error.
    pub scope_empty: bool,
    pub policies_considered: usize,
    pub buckets: usize,
    /// Candidate pairs classified.
    pub candidate_pairs: usize,
    /// Pairs skipped because a pending conflict already covers them.
    pub skipped_existing: usize,
    /// Inserts refused by the store's pending-pair uniqueness, typically a
    /// concurrent run that recorded the same pair first.
    pub duplicates_rejected: usize,
    pub created: Vec<FindingId>,
    /// Open group findings widened by this run.
    pub updated: Vec<InconsistencyId>,
    pub counts: FindingCounts,
    /// Findings recorded without an explanation because the recommendation
    /// service timed out or was unavailable.
    pub unexplained: usize,
    /// One message per pair or group that failed; the run carries on.
    pub failures: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DetectionReport {
    fn new(run_id: Uuid, scope: &DetectionScope, cross_application: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            scope: scope.clone(),
            cross_application,
            scope_empty: false,
            policies_considered: 0,
            buckets: 0,
            candidate_pairs: 0,
            skipped_existing: 0,
            duplicates_rejected: 0,
            created: Vec::new(),
            updated: Vec::new(),
            counts: FindingCounts::default(),
            unexplained: 0,
            failures: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }
}

/// Finding counts by status and severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub conflicts_by_status: BTreeMap<String, usize>,
    pub conflicts_by_severity: BTreeMap<String, usize>,
    pub inconsistencies_by_status: BTreeMap<String, usize>,
    pub inconsistencies_by_severity: BTreeMap<String, usize>,
}

/// What one worker produced for one bucket.
#[derive(Debug, Default)]
struct BucketOutcome {
    candidates: usize,
    skipped_existing: usize,
    duplicates_rejected: usize,
    created: Vec<(ConflictId, ConflictType)>,
    unexplained: usize,
    failures: Vec<String>,
}

/// Conflict and inconsistency detection engine.
pub struct DetectionEngine {
    stores: EngineStores,
    config: EngineConfig,
    vocabulary: Vocabulary,
    rules: Arc<dyn PairClassifier>,
    advisor: Option<Arc<dyn RecommendationService>>,
    resolution: ResolutionManager,
    /// Serializes group aggregation between concurrent runs on this engine.
    aggregation: Mutex<()>,
}

impl std::fmt::Debug for DetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("config", &self.config)
            .field("advisor", &self.advisor.is_some())
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}

impl DetectionEngine {
    /// Creates an engine with the rule classifier and no recommendation
    /// service.
    pub fn new(stores: EngineStores, config: EngineConfig) -> AccordResult<Self> {
        config.validate()?;
        let vocabulary = config.vocabulary()?;
        let resolution = ResolutionManager::new(
            Arc::clone(&stores.policies),
            Arc::clone(&stores.conflicts),
            Arc::clone(&stores.inconsistencies),
            config.lock_stripes,
        );
        Ok(Self {
            stores,
            config,
            vocabulary,
            rules: Arc::new(RuleClassifier::new()),
            advisor: None,
            resolution,
            aggregation: Mutex::new(()),
        })
    }

    /// Attaches a recommendation service, called with the configured timeout.
    #[must_use]
    pub fn with_advisor(mut self, service: Arc<dyn RecommendationService>) -> Self {
        self.advisor = Some(service);
        self
    }

    /// Adapter for one detection run. Its worker threads end with the run.
    fn run_advisor(&self) -> RecommendationAdapter {
        match &self.advisor {
            Some(service) => RecommendationAdapter::with_workers(
                Arc::clone(service),
                self.config.advisor_timeout(),
                self.config.workers,
            ),
            None => RecommendationAdapter::disabled(),
        }
    }

    /// Replaces the deterministic pair classifier.
    #[must_use]
    pub fn with_classifier(mut self, rules: Arc<dyn PairClassifier>) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn stores(&self) -> &EngineStores {
        &self.stores
    }

    /// Runs detection to completion.
    pub fn detect(&self, scope: &DetectionScope, cross_application: bool) -> AccordResult<DetectionReport> {
        self.detect_with_cancellation(scope, cross_application, &CancellationToken::new())
    }

    /// Runs detection, stopping early once `token` is cancelled.
    ///
    /// A cancelled run returns `ExecutionError::Cancelled`; conflicts stored
    /// before cancellation remain valid and are skipped by the next run.
    pub fn detect_with_cancellation(
        &self,
        scope: &DetectionScope,
        cross_application: bool,
        token: &CancellationToken,
    ) -> AccordResult<DetectionReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("detect", %run_id, cross_application);
        let _entered = span.enter();

        let mut report = DetectionReport::new(run_id, scope, cross_application, Utc::now());
        let mode = if cross_application {
            ConflictScope::CrossApplication
        } else {
            ConflictScope::IntraApplication
        };

        let policies = self.stores.policies.list_in_scope(scope.filter())?;
        let criticality = self.criticality_map()?;
        let index = PolicyIndex::build(policies, mode, &self.vocabulary, |app| {
            app.and_then(|id| criticality.get(id).copied()).unwrap_or_default()
        });
        report.policies_considered = index.len();
        report.buckets = index.buckets().len();

        if index.is_empty() {
            report.scope_empty = true;
            report.finished_at = Utc::now();
            info!("no policies in scope");
            return Ok(report);
        }
        info!(
            policies = index.len(),
            buckets = index.buckets().len(),
            upper_bound = index.candidate_upper_bound(),
            "detection started"
        );

        let advisor = self.run_advisor();
        let classifier = Classifier::new(
            Arc::clone(&self.rules),
            advisor.clone(),
            self.config.explain_conflicts,
        );
        let generator = PairGenerator::new(&index)
            .with_applications(scope.filter())
            .with_existing(self.stores.conflicts.as_ref());
        let jobs: Vec<&Bucket> = index.buckets().iter().collect();
        let pool = PoolConfig {
            workers: self.config.workers,
            queue_capacity: self.config.queue_capacity,
        };
        let parent = Span::current();
        let outcomes = runtime::run_pool(jobs, pool, token, |bucket| {
            let _entered = parent.enter();
            self.process_bucket(&generator, &classifier, bucket, token)
        })?;

        for outcome in outcomes {
            report.candidate_pairs += outcome.candidates;
            report.skipped_existing += outcome.skipped_existing;
            report.duplicates_rejected += outcome.duplicates_rejected;
            report.unexplained += outcome.unexplained;
            report.failures.extend(outcome.failures);
            for (id, conflict_type) in outcome.created {
                report.counts.record(conflict_type);
                report.created.push(FindingId::Conflict(id));
            }
        }

        if token.is_cancelled() {
            warn!(stored = report.created.len(), "detection cancelled");
            return Err(ExecutionError::Cancelled.into());
        }

        if mode == ConflictScope::CrossApplication {
            let _serial = self
                .aggregation
                .lock()
                .map_err(|_| AccordError::internal("aggregation lock poisoned"))?;
            let aggregation = GroupAggregator::new(
                self.stores.policies.as_ref(),
                self.stores.conflicts.as_ref(),
                self.stores.inconsistencies.as_ref(),
                &advisor,
                &self.vocabulary,
            )
            .with_criticality(&criticality)
            .run(index.resource_types());
            report.counts.inconsistent_enforcement = aggregation.created.len();
            report
                .created
                .extend(aggregation.created.into_iter().map(FindingId::InconsistentEnforcement));
            report.updated = aggregation.updated;
            report.unexplained += aggregation.unexplained;
            report.failures.extend(aggregation.failures);
        }

        report.finished_at = Utc::now();
        info!(
            candidates = report.candidate_pairs,
            created = report.created.len(),
            updated = report.updated.len(),
            unexplained = report.unexplained,
            failures = report.failures.len(),
            "detection finished"
        );
        Ok(report)
    }

    fn criticality_map(&self) -> AccordResult<BTreeMap<ApplicationId, Criticality>> {
        Ok(self
            .stores
            .applications
            .list()?
            .into_iter()
            .map(|app| (app.id, app.criticality))
            .collect())
    }

    fn process_bucket<'a>(
        &self,
        generator: &PairGenerator<'a>,
        classifier: &Classifier,
        bucket: &'a Bucket,
        token: &CancellationToken,
    ) -> BucketOutcome {
        let mut outcome = BucketOutcome::default();
        let mut pairs = generator.bucket(bucket);
        debug!(bucket = %bucket.key, members = bucket.members.len(), "classifying bucket");

        for pair in pairs.by_ref() {
            if token.is_cancelled() {
                break;
            }
            outcome.candidates += 1;
            let Some(classified) = classifier.classify(&pair) else {
                continue;
            };
            let degraded = classified.degraded;
            match self.record(&pair, classified) {
                Ok(conflict) => {
                    debug!(
                        conflict = %conflict.id,
                        pair = %pair.key,
                        conflict_type = %conflict.conflict_type,
                        severity = %conflict.severity,
                        "conflict recorded"
                    );
                    if degraded {
                        outcome.unexplained += 1;
                    }
                    outcome.created.push((conflict.id, conflict.conflict_type));
                }
                Err(RecordError::Duplicate) => {
                    debug!(pair = %pair.key, "pair already recorded by another run");
                    outcome.duplicates_rejected += 1;
                }
                Err(RecordError::Failed(e)) => {
                    warn!(pair = %pair.key, error = %e, "conflict not recorded");
                    outcome.failures.push(format!("{}: {e}", pair.key));
                }
            }
        }
        outcome.skipped_existing = pairs.skipped_existing();
        outcome
    }

    fn record(&self, pair: &CandidatePair<'_>, classified: ClassifiedPair) -> Result<Conflict, RecordError> {
        let conflict = Conflict::new(
            pair.key,
            pair.scope,
            classified.conflict_type,
            classified.severity,
            pair.a.resource_key.clone(),
            classified.description,
        )
        .with_advice(classified.explanation, classified.suggested_policy);
        conflict
            .validate(&pair.a.policy, &pair.b.policy)
            .map_err(|e| RecordError::Failed(e.to_string()))?;
        match self.stores.conflicts.insert(conflict.clone()) {
            Ok(()) => Ok(conflict),
            Err(StorageError::DuplicateKey(_)) => Err(RecordError::Duplicate),
            Err(e) => Err(RecordError::Failed(e.to_string())),
        }
    }

    /// Resolves a pending conflict. See [`ResolutionManager::resolve_conflict`].
    pub fn resolve(&self, id: ConflictId, resolution: Resolution, notes: Option<String>) -> AccordResult<Conflict> {
        self.resolution.resolve_conflict(id, resolution, notes)
    }

    /// Moves a group finding through its lifecycle. See
    /// [`ResolutionManager::update_status`].
    pub fn update_status(
        &self,
        id: InconsistencyId,
        status: InconsistencyStatus,
        notes: Option<String>,
        resolved_by: Option<String>,
    ) -> AccordResult<InconsistentEnforcement> {
        self.resolution.update_status(id, status, notes, resolved_by)
    }

    /// Rolls the recommended policy out to `targets`, or to every
    /// outstanding application when `targets` is empty.
    pub fn apply_unified_policy(&self, id: InconsistencyId, targets: &[ApplicationId]) -> AccordResult<ApplyReport> {
        self.resolution.apply_unified_policy(id, targets)
    }

    pub fn conflict(&self, id: ConflictId) -> AccordResult<Option<Conflict>> {
        Ok(self.stores.conflicts.get(id)?)
    }

    pub fn inconsistency(&self, id: InconsistencyId) -> AccordResult<Option<InconsistentEnforcement>> {
        Ok(self.stores.inconsistencies.get(id)?)
    }

    pub fn list_conflicts(&self, filter: &ConflictFilter) -> AccordResult<Vec<Conflict>> {
        Ok(self.stores.conflicts.list(filter)?)
    }

    pub fn list_inconsistencies(&self, filter: &InconsistencyFilter) -> AccordResult<Vec<InconsistentEnforcement>> {
        Ok(self.stores.inconsistencies.list(filter)?)
    }

    /// Counts every stored finding by status and severity.
    pub fn summary(&self) -> AccordResult<FindingSummary> {
        let mut summary = FindingSummary::default();
        for c in self.stores.conflicts.list(&ConflictFilter::default())? {
            *summary.conflicts_by_status.entry(c.status.to_string()).or_default() += 1;
            *summary.conflicts_by_severity.entry(c.severity.to_string()).or_default() += 1;
        }
        for f in self.stores.inconsistencies.list(&InconsistencyFilter::default())? {
            *summary.inconsistencies_by_status.entry(f.status.to_string()).or_default() += 1;
            *summary.inconsistencies_by_severity.entry(f.severity.to_string()).or_default() += 1;
        }
        Ok(summary)
    }
}

enum RecordError {
    Duplicate,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::application::Application;
    use crate::conflict::ConflictStatus;
    use crate::policy::{Effect, Policy};
    use crate::severity::Severity;

    fn engine() -> DetectionEngine {
        DetectionEngine::new(EngineStores::in_memory(), EngineConfig::default()).unwrap()
    }

    fn add(engine: &DetectionEngine, app: &str, subject: &str, effect: Effect) -> Policy {
        let policy = Policy::builder()
            .application(app)
            .subject(subject)
            .resource("ExpenseReport")
            .action("approve")
            .conditions("amount < 5000")
            .effect(effect)
            .build()
            .unwrap();
        engine.stores().policies.insert(policy.clone()).unwrap();
        policy
    }

    #[test]
    fn test_empty_scope_is_not_an_error() {
        let report = engine().detect(&DetectionScope::All, false).unwrap();
        assert!(report.scope_empty);
        assert!(report.created.is_empty());
    }

    #[test]
    fn test_intra_detection_records_contradiction() {
        let engine = engine();
        add(&engine, "app1", "Manager", Effect::Allow);
        add(&engine, "app1", "Manager", Effect::Deny);

        let report = engine.detect(&DetectionScope::All, false).unwrap();
        assert_eq!(report.counts.contradictory, 1);
        assert_eq!(report.candidate_pairs, 1);

        let pending = engine.list_conflicts(&ConflictFilter::pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, ConflictStatus::Pending);
    }

    #[test]
    fn test_application_filter_limits_scope() {
        let engine = engine();
        add(&engine, "app1", "Manager", Effect::Allow);
        add(&engine, "app1", "Manager", Effect::Deny);
        add(&engine, "app2", "Manager", Effect::Allow);
        add(&engine, "app2", "Manager", Effect::Deny);

        let report = engine
            .detect(&DetectionScope::applications(["app2"]), false)
            .unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.policies_considered, 2);
    }

    #[test]
    fn test_cancelled_run_reports_cancellation() {
        let engine = engine();
        add(&engine, "app1", "Manager", Effect::Allow);
        add(&engine, "app1", "Manager", Effect::Deny);
        let token = CancellationToken::new();
        token.cancel();
        let err = engine
            .detect_with_cancellation(&DetectionScope::All, false, &token)
            .unwrap_err();
        assert!(matches!(err, AccordError::Execution(ExecutionError::Cancelled)));
    }

    #[test]
    fn test_summary_counts() {
        let engine = engine();
        engine
            .stores()
            .applications
            .upsert(Application::new("app1", "Billing"))
            .unwrap();
        add(&engine, "app1", "Manager", Effect::Allow);
        add(&engine, "app1", "Manager", Effect::Deny);
        engine.detect(&DetectionScope::All, false).unwrap();

        let summary = engine.summary().unwrap();
        assert_eq!(summary.conflicts_by_status.get("pending"), Some(&1));
        assert_eq!(summary.conflicts_by_severity.get(&Severity::Medium.to_string()), Some(&1));
        assert!(summary.inconsistencies_by_status.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            workers: 0,
            ..EngineConfig::default()
        };
        assert!(DetectionEngine::new(EngineStores::in_memory(), config).is_err());
    }
}
