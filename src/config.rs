//! Engine configuration, loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::normalize::{Vocabulary, VocabularyConfig};

/// Configuration for a [`DetectionEngine`](crate::DetectionEngine).
///
/// ```toml
/// workers = 8
/// advisor_timeout_ms = 2000
///
/// [vocabulary]
/// roles = [["admin", "administrator", "ROLE_ADMIN"]]
/// resources = [["customer_pii", "CustomerData"]]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Threads classifying buckets in parallel.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Buckets queued ahead of the workers before the producer blocks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-call recommendation service timeout.
    #[serde(default = "default_advisor_timeout_ms")]
    pub advisor_timeout_ms: u64,

    /// Also ask the service to explain conflicts the rules already decided.
    #[serde(default = "default_explain_conflicts")]
    pub explain_conflicts: bool,

    /// Size of the striped per-policy lock table.
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,

    /// Synonym groups consulted during normalization.
    #[serde(default)]
    pub vocabulary: VocabularyConfig,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_advisor_timeout_ms() -> u64 {
    5_000
}

fn default_explain_conflicts() -> bool {
    true
}

fn default_lock_stripes() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            advisor_timeout_ms: default_advisor_timeout_ms(),
            explain_conflicts: default_explain_conflicts(),
            lock_stripes: default_lock_stripes(),
            vocabulary: VocabularyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ValidationError> {
        let config: Self = toml::from_str(contents).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("TOML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("workers", self.workers as u64),
            ("queue_capacity", self.queue_capacity as u64),
            ("advisor_timeout_ms", self.advisor_timeout_ms),
            ("lock_stripes", self.lock_stripes as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        self.vocabulary().map(|_| ())
    }

    /// Builds the equivalence table.
    pub fn vocabulary(&self) -> Result<Vocabulary, ValidationError> {
        Vocabulary::from_config(&self.vocabulary)
    }

    #[must_use]
    pub fn advisor_timeout(&self) -> Duration {
        Duration::from_millis(self.advisor_timeout_ms)
    }
}
