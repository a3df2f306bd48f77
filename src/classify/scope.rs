//! Subject scopes: who a policy grants or denies.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::normalize::Vocabulary;

use super::Relation;

static ALTERNATIVES: OnceLock<Regex> = OnceLock::new();

fn alternatives() -> &'static Regex {
    ALTERNATIVES.get_or_init(|| Regex::new(r"(?i)\s+or\s+|\s*\|\|?\s*|\s*,\s*|\s*/\s*").expect("static regex"))
}

const WILDCARDS: &[&str] = &["*", "any", "anyone", "everyone", "all", "public", "none", "no_check"];

/// The set of principals a policy applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectScope {
    /// No subject check at all.
    Anyone,
    /// Any of the listed (canonical) roles.
    Roles(BTreeSet<String>),
}

impl SubjectScope {
    /// Parses a subject expression such as `"Manager or Director"`.
    ///
    /// Blank subjects and wildcards mean no check; role names are folded
    /// through the vocabulary so synonyms compare equal.
    #[must_use]
    pub fn parse(raw: &str, vocabulary: &Vocabulary) -> Self {
        let mut roles = BTreeSet::new();
        for part in alternatives().split(raw.trim()) {
            let part = part.trim();
            let part = strip_role_prefix(part);
            if part.is_empty() {
                continue;
            }
            if WILDCARDS.iter().any(|w| part.eq_ignore_ascii_case(w)) {
                return Self::Anyone;
            }
            let role = vocabulary.role(part);
            if !role.is_empty() {
                roles.insert(role);
            }
        }
        if roles.is_empty() {
            Self::Anyone
        } else {
            Self::Roles(roles)
        }
    }

    /// Returns true if the scope performs no subject check.
    #[must_use]
    pub fn is_anyone(&self) -> bool {
        matches!(self, Self::Anyone)
    }

    /// Number of roles (0 for `Anyone`).
    #[must_use]
    pub fn role_count(&self) -> usize {
        match self {
            Self::Anyone => 0,
            Self::Roles(r) => r.len(),
        }
    }

    /// How `self` relates to `other` as sets of principals.
    #[must_use]
    pub fn relation(&self, other: &Self) -> Relation {
        match (self, other) {
            (Self::Anyone, Self::Anyone) => Relation::Equal,
            (Self::Anyone, Self::Roles(_)) => Relation::Broader,
            (Self::Roles(_), Self::Anyone) => Relation::Narrower,
            (Self::Roles(a), Self::Roles(b)) => Relation::of_sets(a, b),
        }
    }
}

fn strip_role_prefix(part: &str) -> &str {
    for prefix in ["role:", "role=", "role "] {
        if let (Some(head), Some(rest)) = (part.get(..prefix.len()), part.get(prefix.len()..)) {
            if head.eq_ignore_ascii_case(prefix) && !rest.trim().is_empty() {
                return rest.trim();
            }
        }
    }
    part
}

impl fmt::Display for SubjectScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anyone => write!(f, "*"),
            Self::Roles(roles) => {
                let joined: Vec<&str> = roles.iter().map(String::as_str).collect();
                write!(f, "{}", joined.join("|"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::normalize::VocabularyConfig;

    fn vocab() -> Vocabulary {
        Vocabulary::from_config(&VocabularyConfig {
            roles: vec![vec!["admin".to_string(), "administrator".to_string()]],
            ..VocabularyConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_parse_alternatives() {
        let v = Vocabulary::default();
        let s = SubjectScope::parse("Manager or Director", &v);
        assert_eq!(s.role_count(), 2);
        assert_eq!(SubjectScope::parse("Manager, Director", &v), s);
        assert_eq!(SubjectScope::parse("director | MANAGER", &v), s);
    }

    #[test]
    fn test_parse_wildcards_and_blank() {
        let v = Vocabulary::default();
        assert!(SubjectScope::parse("", &v).is_anyone());
        assert!(SubjectScope::parse("*", &v).is_anyone());
        assert!(SubjectScope::parse("Anyone", &v).is_anyone());
        assert!(SubjectScope::parse("Manager or *", &v).is_anyone());
    }

    #[test]
    fn test_parse_role_prefix_and_synonyms() {
        let v = vocab();
        assert_eq!(
            SubjectScope::parse("role:ADMINISTRATOR", &v),
            SubjectScope::parse("Admin", &v)
        );
    }

    #[test]
    fn test_relations() {
        let v = Vocabulary::default();
        let manager = SubjectScope::parse("Manager", &v);
        let both = SubjectScope::parse("Manager or Director", &v);
        let clerk = SubjectScope::parse("Clerk", &v);
        let director_clerk = SubjectScope::parse("Director or Clerk", &v);
        assert_eq!(manager.relation(&both), Relation::Narrower);
        assert_eq!(both.relation(&manager), Relation::Broader);
        assert_eq!(manager.relation(&clerk), Relation::Disjoint);
        assert_eq!(both.relation(&director_clerk), Relation::Overlap);
        assert_eq!(SubjectScope::Anyone.relation(&manager), Relation::Broader);
        assert_eq!(manager.relation(&manager.clone()), Relation::Equal);
    }

    #[test]
    fn test_display_is_canonical() {
        let v = Vocabulary::default();
        assert_eq!(SubjectScope::parse("Manager or Director", &v).to_string(), "director|manager");
        assert_eq!(SubjectScope::Anyone.to_string(), "*");
    }
}
