use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use accordance::{
    Advice, AdvisorError, Application, ConflictFilter, ConflictScope, ConflictType, Criticality, DetectionEngine,
    DetectionScope, Effect, EngineConfig, EngineStores, Evidence, FindingId, InconsistencyFilter, Policy,
    PolicyTemplate, RecommendationService, RiskLevel, Severity, VocabularyConfig,
};

fn engine_with(config: EngineConfig) -> DetectionEngine {
    DetectionEngine::new(EngineStores::in_memory(), config).unwrap()
}

fn engine() -> DetectionEngine {
    engine_with(EngineConfig::default())
}

fn insert(engine: &DetectionEngine, policy: Policy) -> Policy {
    engine.stores().policies.insert(policy.clone()).unwrap();
    policy
}

fn pii_read(app: &str, subject: &str) -> Policy {
    Policy::builder()
        .application(app)
        .subject(subject)
        .resource("CustomerPII")
        .action("read")
        .build()
        .unwrap()
}

struct CountingAdvisor {
    calls: AtomicUsize,
}

impl RecommendationService for CountingAdvisor {
    fn recommend(&self, evidence: &Evidence) -> Result<Advice, AdvisorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let explanation = match evidence {
            Evidence::Pair { .. } => "these rules disagree".to_string(),
            Evidence::Group { variants, .. } => format!("{variants} variants across applications"),
        };
        Ok(Advice {
            explanation,
            recommended_policy: Some(PolicyTemplate {
                subject: "admin".to_string(),
                resource: "CustomerPII".to_string(),
                action: "read".to_string(),
                conditions: Some("mfa == true".to_string()),
                effect: Effect::Allow,
            }),
            ..Advice::default()
        })
    }
}

struct SlowAdvisor;

impl RecommendationService for SlowAdvisor {
    fn recommend(&self, _evidence: &Evidence) -> Result<Advice, AdvisorError> {
        thread::sleep(Duration::from_millis(500));
        Ok(Advice::default())
    }
}

#[test]
fn detect_contradiction_in_one_application() {
    let engine = engine();
    let allow = insert(
        &engine,
        Policy::builder()
            .application("finance")
            .subject("Manager")
            .resource("ExpenseReport")
            .action("approve")
            .conditions("amount < 5000")
            .risk_level(RiskLevel::High)
            .build()
            .unwrap(),
    );
    insert(
        &engine,
        Policy::builder()
            .application("finance")
            .subject("Manager")
            .resource("ExpenseReport")
            .action("approve")
            .conditions("amount < 5000")
            .effect(Effect::Deny)
            .build()
            .unwrap(),
    );

    let report = engine.detect(&DetectionScope::All, false).unwrap();
    assert_eq!(report.counts.contradictory, 1);
    assert_eq!(report.counts.total(), 1);

    let conflicts = engine.list_conflicts(&ConflictFilter::pending()).unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::Contradictory);
    assert_eq!(conflict.severity, Severity::High);
    assert_eq!(conflict.scope, ConflictScope::IntraApplication);
    assert_ne!(conflict.policy_a_id, conflict.policy_b_id);
    assert!(conflict.pair_key().contains(allow.id));
}

#[test]
fn detect_overlapping_subjects_with_different_thresholds() {
    let engine = engine();
    insert(
        &engine,
        Policy::builder()
            .application("finance")
            .subject("Manager")
            .resource("ExpenseReport")
            .action("approve")
            .conditions("amount < 5000")
            .build()
            .unwrap(),
    );
    insert(
        &engine,
        Policy::builder()
            .application("finance")
            .subject("Manager or Director")
            .resource("expense-report")
            .action("approve")
            .conditions("amount < 10000")
            .build()
            .unwrap(),
    );

    let report = engine.detect(&DetectionScope::All, false).unwrap();
    assert_eq!(report.counts.overlapping, 1);
    let conflict = &engine.list_conflicts(&ConflictFilter::pending()).unwrap()[0];
    assert_eq!(conflict.severity, Severity::Low);
}

#[test]
fn detect_cross_application_inconsistency_groups_three_apps() {
    let engine = engine();
    insert(&engine, pii_read("app1", "ADMIN"));
    insert(&engine, pii_read("app2", "ADMINISTRATOR"));
    insert(&engine, pii_read("app3", ""));

    let report = engine.detect(&DetectionScope::All, true).unwrap();
    assert_eq!(report.counts.inconsistent, 3);
    assert_eq!(report.counts.inconsistent_enforcement, 1);
    assert!(report
        .created
        .iter()
        .any(|id| matches!(id, FindingId::InconsistentEnforcement(_))));

    let findings = engine.list_inconsistencies(&InconsistencyFilter::default()).unwrap();
    assert_eq!(findings.len(), 1);
    let finding = &findings[0];
    assert_eq!(finding.resource_type, "customer_pii");
    assert_eq!(finding.affected_application_ids.len(), 3);
    assert_eq!(finding.policy_ids.len(), 3);
    assert_eq!(finding.severity, Severity::Critical);
    assert!(!finding.explained);
}

#[test]
fn synonym_table_folds_role_variants() {
    let config = EngineConfig {
        vocabulary: VocabularyConfig {
            roles: vec![vec!["admin".to_string(), "administrator".to_string()]],
            ..VocabularyConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = engine_with(config);
    insert(&engine, pii_read("app1", "ADMIN"));
    insert(&engine, pii_read("app2", "ADMINISTRATOR"));

    let report = engine.detect(&DetectionScope::All, true).unwrap();
    assert_eq!(report.candidate_pairs, 1);
    assert!(report.created.is_empty());
}

#[test]
fn critical_application_escalates_two_variant_group() {
    let engine = engine();
    engine
        .stores()
        .applications
        .upsert(Application::new("app2", "Payments").with_criticality(Criticality::Critical))
        .unwrap();
    insert(&engine, pii_read("app1", "admin"));
    insert(&engine, pii_read("app2", "auditor"));

    engine.detect(&DetectionScope::All, true).unwrap();
    let findings = engine.list_inconsistencies(&InconsistencyFilter::default()).unwrap();
    assert_eq!(findings.len(), 1);
    assert!(findings[0].severity >= Severity::High);
}

#[test]
fn detect_twice_creates_nothing_new() {
    let engine = engine();
    insert(&engine, pii_read("app1", "ADMIN"));
    insert(&engine, pii_read("app2", "ADMINISTRATOR"));
    insert(&engine, pii_read("app3", ""));

    let first = engine.detect(&DetectionScope::All, true).unwrap();
    assert_eq!(first.created.len(), 4);

    let second = engine.detect(&DetectionScope::All, true).unwrap();
    assert!(second.created.is_empty());
    assert!(second.updated.is_empty());
    assert_eq!(second.skipped_existing, 3);
    assert_eq!(engine.list_conflicts(&ConflictFilter::default()).unwrap().len(), 3);
    assert_eq!(
        engine
            .list_inconsistencies(&InconsistencyFilter::default())
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn new_application_widens_existing_group() {
    let engine = engine();
    insert(&engine, pii_read("app1", "admin"));
    insert(&engine, pii_read("app2", ""));
    engine.detect(&DetectionScope::All, true).unwrap();

    insert(&engine, pii_read("app3", "auditor"));
    let report = engine.detect(&DetectionScope::All, true).unwrap();
    assert_eq!(report.counts.inconsistent_enforcement, 0);
    assert_eq!(report.updated.len(), 1);

    let findings = engine.list_inconsistencies(&InconsistencyFilter::default()).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].affected_application_ids.len(), 3);
}

#[test]
fn empty_scope_returns_zero_findings() {
    let engine = engine();
    insert(&engine, pii_read("app1", "admin"));

    let report = engine
        .detect(&DetectionScope::applications(["unknown-app"]), true)
        .unwrap();
    assert!(report.scope_empty);
    assert_eq!(report.counts.total(), 0);
}

#[test]
fn one_recommendation_per_group() {
    let advisor = Arc::new(CountingAdvisor {
        calls: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        explain_conflicts: false,
        ..EngineConfig::default()
    };
    let engine = engine_with(config).with_advisor(advisor.clone());
    insert(&engine, pii_read("app1", "ADMIN"));
    insert(&engine, pii_read("app2", "ADMINISTRATOR"));
    insert(&engine, pii_read("app3", ""));

    engine.detect(&DetectionScope::All, true).unwrap();
    assert_eq!(advisor.calls.load(Ordering::SeqCst), 1);

    let finding = &engine.list_inconsistencies(&InconsistencyFilter::default()).unwrap()[0];
    assert!(finding.explained);
    assert_eq!(finding.recommended_policy.conditions.as_deref(), Some("mfa == true"));
    assert_eq!(finding.recommendation_explanation, "3 variants across applications");
}

#[test]
fn explanations_attached_to_rule_conflicts() {
    let advisor = Arc::new(CountingAdvisor {
        calls: AtomicUsize::new(0),
    });
    let engine = engine().with_advisor(advisor);
    insert(&engine, pii_read("app1", "admin"));
    insert(&engine, pii_read("app1", "admin or auditor"));

    engine.detect(&DetectionScope::All, false).unwrap();
    let conflict = &engine.list_conflicts(&ConflictFilter::pending()).unwrap()[0];
    assert_eq!(conflict.ai_recommendation.as_deref(), Some("these rules disagree"));
    assert!(conflict.suggested_policy.is_some());
}

#[test]
fn adapter_timeout_degrades_instead_of_failing() {
    let config = EngineConfig {
        advisor_timeout_ms: 50,
        ..EngineConfig::default()
    };
    let engine = engine_with(config).with_advisor(Arc::new(SlowAdvisor));
    insert(
        &engine,
        Policy::builder()
            .application("app1")
            .subject("admin")
            .resource("CustomerPII")
            .action("read")
            .conditions("region in ('eu', 'us')")
            .build()
            .unwrap(),
    );
    insert(&engine, pii_read("app2", "admin"));

    let report = engine.detect(&DetectionScope::All, true).unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(report.counts.inconsistent, 1);
    assert_eq!(report.counts.inconsistent_enforcement, 1);
    assert_eq!(report.unexplained, 2);

    let conflict = &engine.list_conflicts(&ConflictFilter::pending()).unwrap()[0];
    assert!(conflict.ai_recommendation.is_none());
    assert_eq!(conflict.severity, Severity::Low);

    let finding = &engine.list_inconsistencies(&InconsistencyFilter::default()).unwrap()[0];
    assert!(!finding.explained);
    assert!(finding.recommendation_explanation.contains("timed out"));
}

#[test]
fn advisor_threads_end_with_the_run() {
    let advisor = Arc::new(CountingAdvisor {
        calls: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        workers: 3,
        ..EngineConfig::default()
    };
    let engine = engine_with(config).with_advisor(advisor.clone());
    insert(&engine, pii_read("app1", "admin"));
    insert(&engine, pii_read("app1", "admin or auditor"));
    insert(&engine, pii_read("app2", ""));

    for _ in 0..3 {
        engine.detect(&DetectionScope::All, true).unwrap();
    }
    assert!(advisor.calls.load(Ordering::SeqCst) > 0);

    // Only the test and the engine keep the service once pool workers exit.
    let give_up = std::time::Instant::now() + Duration::from_secs(2);
    while Arc::strong_count(&advisor) > 2 && std::time::Instant::now() < give_up {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(Arc::strong_count(&advisor), 2);
}

#[test]
fn concurrent_runs_do_not_duplicate_conflicts() {
    let engine = Arc::new(engine());
    for app in ["app1", "app2", "app3", "app4"] {
        insert(&engine, pii_read(app, app));
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.detect(&DetectionScope::All, true).unwrap())
        })
        .collect();
    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let created: usize = reports.iter().map(|r| r.counts.inconsistent).sum();
    assert_eq!(created, 6);
    assert_eq!(engine.list_conflicts(&ConflictFilter::default()).unwrap().len(), 6);

    let findings = engine.list_inconsistencies(&InconsistencyFilter::default()).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].affected_application_ids.len(), 4);
}
