//! Term normalization and the injectable equivalence table.
//!
//! Blocking keys, role names and actions are compared after two steps:
//! 1. lexical normalization (`CustomerPII`, `customer-pii` and `Customer PII`
//!    all become `customer_pii`);
//! 2. folding through a configured synonym table (`administrator -> admin`).
//!
//! No synonyms are built in; the authoritative list is external configuration.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

static LOWER_UPPER: OnceLock<Regex> = OnceLock::new();
static ACRONYM_WORD: OnceLock<Regex> = OnceLock::new();
static SEPARATORS: OnceLock<Regex> = OnceLock::new();

fn lower_upper() -> &'static Regex {
    LOWER_UPPER.get_or_init(|| Regex::new(r"([a-z0-9])([A-Z])").expect("static regex"))
}

fn acronym_word() -> &'static Regex {
    ACRONYM_WORD.get_or_init(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").expect("static regex"))
}

fn separators() -> &'static Regex {
    SEPARATORS.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("static regex"))
}

/// Lexically normalizes a term: splits camel case, lowercases, and collapses
/// punctuation and whitespace into single underscores.
#[must_use]
pub fn normalize_term(raw: &str) -> String {
    let split = acronym_word().replace_all(raw.trim(), "${1}_${2}");
    let split = lower_upper().replace_all(&split, "${1}_${2}");
    let lowered = split.to_lowercase();
    separators()
        .replace_all(&lowered, "_")
        .trim_matches('_')
        .to_string()
}

/// Synonym groups as written in configuration.
///
/// Each group lists equivalent terms; the first one is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyConfig {
    #[serde(default)]
    pub resources: Vec<Vec<String>>,
    #[serde(default)]
    pub roles: Vec<Vec<String>>,
    #[serde(default)]
    pub actions: Vec<Vec<String>>,
}

/// A normalized term -> canonical term mapping.
#[derive(Debug, Clone, Default)]
pub struct SynonymMap {
    canonical: HashMap<String, String>,
}

impl SynonymMap {
    /// Builds the map from synonym groups.
    ///
    /// Rejects a term that appears in two groups with different canonical forms.
    pub fn from_groups(kind: &str, groups: &[Vec<String>]) -> Result<Self, ValidationError> {
        let mut canonical: HashMap<String, String> = HashMap::new();
        for group in groups {
            let mut terms = group.iter().map(|t| normalize_term(t)).filter(|t| !t.is_empty());
            let Some(head) = terms.next() else {
                continue;
            };
            for term in std::iter::once(head.clone()).chain(terms) {
                match canonical.get(&term) {
                    Some(existing) if *existing != head => {
                        return Err(ValidationError::InvalidConfig {
                            reason: format!(
                                "{kind} synonym '{term}' maps to both '{existing}' and '{head}'"
                            ),
                        });
                    }
                    _ => {
                        canonical.insert(term, head.clone());
                    }
                }
            }
        }
        Ok(Self { canonical })
    }

    /// Normalizes a raw term and folds it to its canonical synonym.
    #[must_use]
    pub fn canonical(&self, raw: &str) -> String {
        let term = normalize_term(raw);
        self.canonical.get(&term).cloned().unwrap_or(term)
    }

    /// Number of mapped terms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    /// Returns true if no synonyms are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

/// The equivalence table consulted when computing blocking keys and comparing
/// subjects and actions.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    resources: SynonymMap,
    roles: SynonymMap,
    actions: SynonymMap,
}

impl Vocabulary {
    /// Builds the table from configuration.
    pub fn from_config(config: &VocabularyConfig) -> Result<Self, ValidationError> {
        Ok(Self {
            resources: SynonymMap::from_groups("resource", &config.resources)?,
            roles: SynonymMap::from_groups("role", &config.roles)?,
            actions: SynonymMap::from_groups("action", &config.actions)?,
        })
    }

    /// The blocking key for a resource.
    #[must_use]
    pub fn resource_key(&self, resource: &str) -> String {
        self.resources.canonical(resource)
    }

    /// The canonical form of a role name.
    #[must_use]
    pub fn role(&self, role: &str) -> String {
        self.roles.canonical(role)
    }

    /// The canonical form of an action.
    #[must_use]
    pub fn action(&self, action: &str) -> String {
        self.actions.canonical(action)
    }
}
