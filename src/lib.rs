//! # Accordance - Conflict & Inconsistency Detection for Authorization Policies
//!
//! Accordance inspects authorization rules mined from many applications and
//! finds where they disagree, overlap, or are enforced differently for the
//! same kind of resource. It then drives an operator-led resolution workflow
//! that supersedes, merges, or rolls out a unified policy.
//!
//! ## Core Concepts
//!
//! - **Policy**: a subject/resource/action/condition rule with an allow or deny effect
//! - **Conflict**: a pairwise finding (`contradictory`, `overlapping` or `inconsistent`)
//! - **InconsistentEnforcement**: one resource type enforced differently by two or more applications
//! - **Blocking key**: the normalized resource type that bounds which policies are compared
//!
//! ## Usage
//!
//! ```rust,ignore
//! use accordance::{DetectionEngine, DetectionScope, EngineConfig, EngineStores, Policy};
//!
//! let engine = DetectionEngine::new(EngineStores::in_memory(), EngineConfig::default())?;
//! engine.stores().policies.insert(
//!     Policy::builder()
//!         .application("billing")
//!         .subject("Manager")
//!         .resource("ExpenseReport")
//!         .action("approve")
//!         .conditions("amount < 5000")
//!         .build()?,
//! )?;
//!
//! let report = engine.detect(&DetectionScope::All, false)?;
//! println!("{} findings", report.created.len());
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

// Core types
pub mod application;
pub mod conflict;
pub mod error;
pub mod inconsistency;
pub mod policy;
pub mod severity;

// Normalization and configuration
pub mod config;
pub mod normalize;

// Detection pipeline
pub mod advisor;
pub mod aggregate;
pub mod classify;
pub mod index;
pub mod pairs;

// Resolution, storage and the engine facade
pub mod engine;
pub mod resolution;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use advisor::{Advice, Evidence, PolicySummary, RecommendationAdapter, RecommendationService};
pub use aggregate::{AggregationOutcome, GroupAggregator};
pub use application::{Application, ApplicationId, Criticality};
pub use classify::{ClassifiedPair, Classifier, PairClassifier, RuleClassifier, Verdict};
pub use config::EngineConfig;
pub use conflict::{Conflict, ConflictId, ConflictScope, ConflictStatus, ConflictType, PairKey, ResolutionStrategy};
pub use engine::{
    CancellationToken, DetectionEngine, DetectionReport, DetectionScope, EngineStores, FindingCounts, FindingId,
    FindingSummary,
};
pub use error::{AccordError, AccordResult, AdvisorError, ExecutionError, ValidationError};
pub use inconsistency::{InconsistencyId, InconsistencyStatus, InconsistentEnforcement};
pub use index::{PolicyFacts, PolicyIndex};
pub use normalize::{Vocabulary, VocabularyConfig};
pub use pairs::{CandidatePair, PairGenerator};
pub use policy::{Effect, Policy, PolicyBuilder, PolicyId, PolicyStatus, PolicyTemplate};
pub use resolution::{ApplyReport, Resolution, ResolutionManager};
pub use severity::{RiskLevel, Severity};
pub use storage::{
    ApplicationStore, ConflictFilter, ConflictStore, InMemoryStores, InconsistencyFilter, InconsistencyStore,
    PolicyStore, StorageError,
};
