//! Recommendation adapter.
//!
//! Wraps an external recommendation service behind a timeout and a small
//! pool of worker threads. Every call is made at most once; a failure or
//! timeout yields an error that callers turn into a degraded, unexplained
//! finding instead of dropping it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::application::ApplicationId;
use crate::conflict::{ConflictScope, ConflictType};
use crate::error::AdvisorError;
use crate::policy::{Effect, Policy, PolicyId, PolicyTemplate};
use crate::severity::{RiskLevel, Severity};

/// The fields of a policy the service sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub id: PolicyId,
    pub application_id: Option<ApplicationId>,
    pub subject: String,
    pub resource: String,
    pub action: String,
    pub conditions: Option<String>,
    pub effect: Effect,
    pub risk_level: RiskLevel,
}

impl From<&Policy> for PolicySummary {
    fn from(policy: &Policy) -> Self {
        Self {
            id: policy.id,
            application_id: policy.application_id.clone(),
            subject: policy.subject.clone(),
            resource: policy.resource.clone(),
            action: policy.action.clone(),
            conditions: policy.conditions.clone(),
            effect: policy.effect,
            risk_level: policy.risk_level,
        }
    }
}

/// What is sent to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// A candidate pair, with the rule verdict if one was reached.
    Pair {
        scope: ConflictScope,
        rule_verdict: Option<ConflictType>,
        policies: [PolicySummary; 2],
    },
    /// A group of policies enforcing one resource differently.
    Group {
        resource_type: String,
        actions: Vec<String>,
        variants: usize,
        policies: Vec<PolicySummary>,
    },
}

/// What the service returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    /// Classification for pairs the rules could not decide; `None` means
    /// the service found no conflict.
    #[serde(default)]
    pub classification: Option<ConflictType>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub recommended_policy: Option<PolicyTemplate>,
}

/// An external source of explanations and recommended policies.
pub trait RecommendationService: Send + Sync {
    fn recommend(&self, evidence: &Evidence) -> Result<Advice, AdvisorError>;
}

type Reply = Result<Advice, AdvisorError>;

struct Job {
    evidence: Evidence,
    deadline: Instant,
    reply: Sender<Reply>,
}

/// Fixed set of named threads that call the service.
///
/// Dropping the last handle closes the queue; each worker exits once it
/// finishes the call it is in, so a service that hangs holds at most one
/// thread per worker.
struct AdvisorPool {
    tx: Sender<Job>,
    workers: usize,
}

impl AdvisorPool {
    fn start(service: Arc<dyn RecommendationService>, workers: usize) -> Self {
        let (tx, rx) = bounded::<Job>(workers.max(1));
        let mut started = 0usize;
        for idx in 0..workers.max(1) {
            let rx: Receiver<Job> = rx.clone();
            let service = Arc::clone(&service);
            let spawned = thread::Builder::new()
                .name(format!("accordance-advisor-{idx}"))
                .spawn(move || {
                    for job in rx.iter() {
                        // The caller has already given up on this one.
                        if Instant::now() >= job.deadline {
                            continue;
                        }
                        let result = panic::catch_unwind(AssertUnwindSafe(|| service.recommend(&job.evidence)))
                            .unwrap_or_else(|_| {
                                Err(AdvisorError::Unavailable {
                                    reason: "recommendation service panicked".to_string(),
                                })
                            });
                        let _ = job.reply.send(result);
                    }
                });
            match spawned {
                Ok(_) => started += 1,
                Err(e) => warn!(worker = idx, error = %e, "failed to spawn advisor worker"),
            }
        }
        debug!(workers = started, "advisor pool started");
        Self { tx, workers: started }
    }
}

/// Calls a [`RecommendationService`] with a deadline.
///
/// Requests run on a small pool of worker threads owned by the adapter and
/// its clones. The pool lives as long as the adapter does, so an adapter
/// built per detection run releases its threads when the run ends.
#[derive(Clone)]
pub struct RecommendationAdapter {
    pool: Option<Arc<AdvisorPool>>,
    timeout: Duration,
}

impl std::fmt::Debug for RecommendationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationAdapter")
            .field("enabled", &self.is_enabled())
            .field("workers", &self.workers())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RecommendationAdapter {
    /// Worker count used by [`RecommendationAdapter::new`].
    pub const DEFAULT_WORKERS: usize = 2;

    #[must_use]
    pub fn new(service: Arc<dyn RecommendationService>, timeout: Duration) -> Self {
        Self::with_workers(service, timeout, Self::DEFAULT_WORKERS)
    }

    /// Starts an adapter whose calls share `workers` threads.
    #[must_use]
    pub fn with_workers(service: Arc<dyn RecommendationService>, timeout: Duration, workers: usize) -> Self {
        Self {
            pool: Some(Arc::new(AdvisorPool::start(service, workers))),
            timeout,
        }
    }

    /// An adapter with no service behind it; every request is unavailable.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            pool: None,
            timeout: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of threads serving requests; zero when disabled.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.workers)
    }

    /// Requests advice, giving up after the configured timeout.
    ///
    /// Time spent waiting for a free worker counts against the timeout. A
    /// request that times out is never retried; if it is still queued the
    /// worker drops it unanswered.
    pub fn request(&self, evidence: Evidence) -> Result<Advice, AdvisorError> {
        let Some(pool) = &self.pool else {
            return Err(AdvisorError::Unavailable {
                reason: "no recommendation service configured".to_string(),
            });
        };

        let deadline = Instant::now() + self.timeout;
        let (reply, rx) = bounded(1);
        let job = Job {
            evidence,
            deadline,
            reply,
        };
        match pool.tx.send_deadline(job, deadline) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(self.timed_out("no advisor worker free")),
            Err(SendTimeoutError::Disconnected(_)) => {
                return Err(AdvisorError::Unavailable {
                    reason: "no advisor workers running".to_string(),
                });
            }
        }

        let advice = match rx.recv_deadline(deadline) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => return Err(self.timed_out("recommendation timed out")),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(AdvisorError::Unavailable {
                    reason: "recommendation worker exited without answering".to_string(),
                });
            }
        };
        validate(advice)
    }

    fn timed_out(&self, what: &'static str) -> AdvisorError {
        let duration_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        debug!(timeout_ms = duration_ms, "{what}");
        AdvisorError::Timeout { duration_ms }
    }
}

fn validate(mut advice: Advice) -> Result<Advice, AdvisorError> {
    advice.explanation = advice.explanation.trim().to_string();
    if let Some(template) = &advice.recommended_policy {
        if template.resource.trim().is_empty() || template.action.trim().is_empty() {
            return Err(AdvisorError::InvalidResponse {
                reason: "recommended policy lacks a resource or action".to_string(),
            });
        }
    }
    Ok(advice)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Fixed(Advice);

    impl RecommendationService for Fixed {
        fn recommend(&self, _evidence: &Evidence) -> Result<Advice, AdvisorError> {
            Ok(self.0.clone())
        }
    }

    struct Slow(Arc<AtomicUsize>);

    impl RecommendationService for Slow {
        fn recommend(&self, _evidence: &Evidence) -> Result<Advice, AdvisorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(500));
            Ok(Advice::default())
        }
    }

    struct Panics;

    impl RecommendationService for Panics {
        fn recommend(&self, _evidence: &Evidence) -> Result<Advice, AdvisorError> {
            panic!("service crashed");
        }
    }

    fn evidence() -> Evidence {
        Evidence::Group {
            resource_type: "customer_pii".to_string(),
            actions: vec!["read".to_string()],
            variants: 2,
            policies: Vec::new(),
        }
    }

    #[test]
    fn test_disabled_adapter_is_unavailable() {
        let err = RecommendationAdapter::disabled().request(evidence()).unwrap_err();
        assert!(matches!(err, AdvisorError::Unavailable { .. }));
    }

    #[test]
    fn test_advice_is_trimmed() {
        let adapter = RecommendationAdapter::new(
            Arc::new(Fixed(Advice {
                explanation: "  require MFA everywhere \n".to_string(),
                ..Advice::default()
            })),
            Duration::from_secs(1),
        );
        let advice = adapter.request(evidence()).unwrap();
        assert_eq!(advice.explanation, "require MFA everywhere");
    }

    #[test]
    fn test_timeout_is_single_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let adapter = RecommendationAdapter::new(Arc::new(Slow(calls.clone())), Duration::from_millis(20));
        let err = adapter.request(evidence()).unwrap_err();
        assert!(matches!(err, AdvisorError::Timeout { duration_ms: 20 }));
        thread::sleep(Duration::from_millis(600));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_service_is_unavailable() {
        let adapter = RecommendationAdapter::with_workers(Arc::new(Panics), Duration::from_secs(1), 1);
        for _ in 0..3 {
            assert!(matches!(
                adapter.request(evidence()),
                Err(AdvisorError::Unavailable { .. })
            ));
        }
    }

    /// Records the name of every thread that serves a call.
    #[derive(Default)]
    struct Threads(Mutex<BTreeSet<String>>);

    impl RecommendationService for Threads {
        fn recommend(&self, _evidence: &Evidence) -> Result<Advice, AdvisorError> {
            let name = thread::current().name().unwrap_or("unnamed").to_string();
            self.0.lock().unwrap().insert(name);
            Ok(Advice::default())
        }
    }

    #[test]
    fn test_requests_reuse_pool_threads() {
        let service = Arc::new(Threads::default());
        let adapter = RecommendationAdapter::with_workers(service.clone(), Duration::from_secs(2), 2);
        assert_eq!(adapter.workers(), 2);

        thread::scope(|scope| {
            for _ in 0..4 {
                let adapter = adapter.clone();
                scope.spawn(move || {
                    for _ in 0..10 {
                        adapter.request(evidence()).unwrap();
                    }
                });
            }
        });

        let names = service.0.lock().unwrap().clone();
        assert!(!names.is_empty() && names.len() <= 2, "{names:?}");
        assert!(names.iter().all(|n| n.starts_with("accordance-advisor-")));
    }

    #[test]
    fn test_expired_queued_request_is_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let adapter = RecommendationAdapter::with_workers(Arc::new(Slow(calls.clone())), Duration::from_millis(20), 1);

        // The only worker is busy with the first call; the second waits in
        // the queue past its deadline.
        assert!(matches!(adapter.request(evidence()), Err(AdvisorError::Timeout { .. })));
        assert!(matches!(adapter.request(evidence()), Err(AdvisorError::Timeout { .. })));
        thread::sleep(Duration::from_millis(700));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_adapter_releases_workers() {
        let service = Arc::new(Threads::default());
        let adapter = RecommendationAdapter::with_workers(service.clone(), Duration::from_secs(1), 3);
        adapter.request(evidence()).unwrap();
        assert_eq!(Arc::strong_count(&service), 4);

        drop(adapter);
        let give_up = Instant::now() + Duration::from_secs(2);
        while Arc::strong_count(&service) > 1 && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(Arc::strong_count(&service), 1);
    }

    #[test]
    fn test_invalid_template_rejected() {
        let adapter = RecommendationAdapter::new(
            Arc::new(Fixed(Advice {
                recommended_policy: Some(PolicyTemplate {
                    subject: "admin".to_string(),
                    resource: " ".to_string(),
                    action: "read".to_string(),
                    conditions: None,
                    effect: Effect::Allow,
                }),
                ..Advice::default()
            })),
            Duration::from_secs(1),
        );
        assert!(matches!(
            adapter.request(evidence()),
            Err(AdvisorError::InvalidResponse { .. })
        ));
    }
}
