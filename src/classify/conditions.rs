//! Condition expressions and the interval algebra used to compare them.
//!
//! A condition string is read as a conjunction of atoms (`amount < 5000 and
//! region == "eu"`). Numeric atoms become intervals per field, string
//! equality atoms become include/exclude sets. Anything else is kept as an
//! opaque atom that only compares equal to the same text.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::normalize::normalize_term;

use super::Relation;

static CONJUNCTION: OnceLock<Regex> = OnceLock::new();
static DISJUNCTION: OnceLock<Regex> = OnceLock::new();
static ATOM: OnceLock<Regex> = OnceLock::new();

fn conjunction() -> &'static Regex {
    CONJUNCTION.get_or_init(|| Regex::new(r"(?i)\s+and\s+|\s*&&\s*").expect("static regex"))
}

fn disjunction() -> &'static Regex {
    DISJUNCTION.get_or_init(|| Regex::new(r"(?i)\s+or\s+|\|\|").expect("static regex"))
}

fn atom() -> &'static Regex {
    ATOM.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(<=|>=|==|!=|=|<|>)\s*(.+?)\s*$")
            .expect("static regex")
    })
}

/// One end of a numeric interval. Unbounded ends use infinities.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bound {
    value: f64,
    inclusive: bool,
}

impl Bound {
    const fn open(value: f64) -> Self {
        Self { value, inclusive: false }
    }

    const fn closed(value: f64) -> Self {
        Self { value, inclusive: true }
    }

    fn is_finite(&self) -> bool {
        self.value.is_finite()
    }
}

/// Orders lower bounds from loosest to tightest.
fn cmp_lower(a: Bound, b: Bound) -> Ordering {
    a.value
        .total_cmp(&b.value)
        .then_with(|| b.inclusive.cmp(&a.inclusive))
}

/// Orders upper bounds from tightest to loosest.
fn cmp_upper(a: Bound, b: Bound) -> Ordering {
    a.value
        .total_cmp(&b.value)
        .then_with(|| a.inclusive.cmp(&b.inclusive))
}

/// A numeric interval over one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    lo: Bound,
    hi: Bound,
}

impl Interval {
    const FULL: Self = Self {
        lo: Bound::open(f64::NEG_INFINITY),
        hi: Bound::open(f64::INFINITY),
    };

    fn from_op(op: &str, value: f64) -> Option<Self> {
        let full = Self::FULL;
        Some(match op {
            "<" => Self { hi: Bound::open(value), ..full },
            "<=" => Self { hi: Bound::closed(value), ..full },
            ">" => Self { lo: Bound::open(value), ..full },
            ">=" => Self { lo: Bound::closed(value), ..full },
            "==" | "=" => Self {
                lo: Bound::closed(value),
                hi: Bound::closed(value),
            },
            _ => return None,
        })
    }

    fn intersect(&self, other: &Self) -> Self {
        let lo = if cmp_lower(self.lo, other.lo) == Ordering::Less { other.lo } else { self.lo };
        let hi = if cmp_upper(self.hi, other.hi) == Ordering::Greater { other.hi } else { self.hi };
        Self { lo, hi }
    }

    fn is_empty(&self) -> bool {
        match self.lo.value.total_cmp(&self.hi.value) {
            Ordering::Greater => true,
            Ordering::Equal => !(self.lo.inclusive && self.hi.inclusive),
            Ordering::Less => false,
        }
    }

    fn is_subset_of(&self, other: &Self) -> bool {
        self.is_empty()
            || (cmp_lower(self.lo, other.lo) != Ordering::Less
                && cmp_upper(self.hi, other.hi) != Ordering::Greater)
    }

    fn relation(&self, other: &Self) -> Relation {
        let inner = self.is_subset_of(other);
        let outer = other.is_subset_of(self);
        match (inner, outer) {
            (true, true) => Relation::Equal,
            (true, false) => Relation::Narrower,
            (false, true) => Relation::Broader,
            (false, false) if self.intersect(other).is_empty() => Relation::Disjoint,
            (false, false) => Relation::Overlap,
        }
    }

    /// True if the two intervals split the number line between them.
    fn complements(&self, other: &Self) -> bool {
        let (low, high) = if self.lo.is_finite() { (other, self) } else { (self, other) };
        !low.lo.is_finite()
            && !high.hi.is_finite()
            && low.hi.is_finite()
            && high.lo.is_finite()
            && low.hi.value.total_cmp(&high.lo.value) == Ordering::Equal
            && low.hi.inclusive != high.lo.inclusive
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.lo.inclusive { '[' } else { '(' };
        let close = if self.hi.inclusive { ']' } else { ')' };
        write!(f, "{open}{},{}{close}", self.lo.value, self.hi.value)
    }
}

/// A string-valued constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextSet {
    Only(BTreeSet<String>),
    Except(BTreeSet<String>),
}

impl TextSet {
    fn intersect(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Only(a), Self::Only(b)) => Self::Only(a.intersection(b).cloned().collect()),
            (Self::Only(a), Self::Except(b)) | (Self::Except(b), Self::Only(a)) => {
                Self::Only(a.difference(b).cloned().collect())
            }
            (Self::Except(a), Self::Except(b)) => Self::Except(a.union(b).cloned().collect()),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Self::Only(values) if values.is_empty())
    }

    fn relation(&self, other: &Self) -> Relation {
        match (self, other) {
            (Self::Only(a), Self::Only(b)) => Relation::of_sets(a, b),
            (Self::Only(a), Self::Except(b)) => {
                if a.is_disjoint(b) {
                    Relation::Narrower
                } else if a.is_subset(b) {
                    Relation::Disjoint
                } else {
                    Relation::Overlap
                }
            }
            (Self::Except(_), Self::Only(_)) => other.relation(self).inverse(),
            (Self::Except(a), Self::Except(b)) => Relation::of_sets(b, a),
        }
    }

    fn complements(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Only(a), Self::Except(b)) | (Self::Except(b), Self::Only(a)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for TextSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (tag, values) = match self {
            Self::Only(v) => ("in", v),
            Self::Except(v) => ("not in", v),
        };
        let joined: Vec<&str> = values.iter().map(String::as_str).collect();
        write!(f, "{tag} {{{}}}", joined.join(","))
    }
}

/// The constraint placed on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldConstraint {
    Range(Interval),
    Text(TextSet),
}

impl FieldConstraint {
    fn intersect(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            (Self::Range(a), Self::Range(b)) => Some(Self::Range(a.intersect(b))),
            (Self::Text(a), Self::Text(b)) => Some(Self::Text(a.intersect(b))),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Range(r) => r.is_empty(),
            Self::Text(t) => t.is_empty(),
        }
    }

    fn relation(&self, other: &Self) -> Relation {
        match (self, other) {
            (Self::Range(a), Self::Range(b)) => a.relation(b),
            (Self::Text(a), Self::Text(b)) => a.relation(b),
            _ => Relation::Unknown,
        }
    }
}

impl fmt::Display for FieldConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range(r) => write!(f, "{r}"),
            Self::Text(t) => write!(f, "{t}"),
        }
    }
}

/// A parsed condition expression.
///
/// The empty set means "no conditions" and matches every request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionSet {
    fields: BTreeMap<String, FieldConstraint>,
    opaque: BTreeSet<String>,
    unsatisfiable: bool,
}

impl ConditionSet {
    /// Parses an optional condition string.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        let mut set = Self::default();
        let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
            return set;
        };
        if disjunction().is_match(raw) {
            set.opaque.insert(collapse_whitespace(raw));
            return set;
        }
        for part in conjunction().split(raw) {
            let part = strip_parens(part.trim());
            if part.is_empty() {
                continue;
            }
            match parse_atom(part) {
                Some((field, constraint)) => set.constrain(field, constraint, part),
                None => {
                    set.opaque.insert(collapse_whitespace(part));
                }
            }
        }
        set
    }

    fn constrain(&mut self, field: String, constraint: FieldConstraint, text: &str) {
        let merged = match self.fields.get(&field) {
            None => Some(constraint),
            Some(existing) => existing.intersect(&constraint),
        };
        match merged {
            Some(c) => {
                if c.is_empty() {
                    self.unsatisfiable = true;
                }
                self.fields.insert(field, c);
            }
            None => {
                self.opaque.insert(collapse_whitespace(text));
            }
        }
    }

    /// True if no conditions apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.opaque.is_empty() && !self.unsatisfiable
    }

    /// True if some part could not be interpreted.
    #[must_use]
    pub fn has_opaque(&self) -> bool {
        !self.opaque.is_empty()
    }

    /// True if the conjunction can never hold.
    #[must_use]
    pub fn is_unsatisfiable(&self) -> bool {
        self.unsatisfiable
    }

    /// Number of constrained fields plus opaque atoms.
    #[must_use]
    pub fn constraint_count(&self) -> usize {
        self.fields.len() + self.opaque.len()
    }

    /// How the set of requests matched by `self` relates to `other`'s.
    #[must_use]
    pub fn relation(&self, other: &Self) -> Relation {
        if self.unsatisfiable || other.unsatisfiable {
            return Relation::Disjoint;
        }
        let structured = self.field_relation(other);
        if self.opaque == other.opaque || structured == Relation::Disjoint {
            return structured;
        }
        Relation::Unknown
    }

    fn field_relation(&self, other: &Self) -> Relation {
        let names: BTreeSet<&String> = self.fields.keys().chain(other.fields.keys()).collect();
        names
            .into_iter()
            .map(|name| match (self.fields.get(name), other.fields.get(name)) {
                (Some(a), Some(b)) => a.relation(b),
                (Some(_), None) => Relation::Narrower,
                (None, Some(_)) => Relation::Broader,
                (None, None) => Relation::Equal,
            })
            .fold(Relation::Equal, Relation::meet)
    }

    /// True if both sets constrain the same single field in mutually
    /// exclusive, jointly exhaustive ways (`amount < 5000` vs `amount >= 5000`).
    #[must_use]
    pub fn complements(&self, other: &Self) -> bool {
        if self.has_opaque() || other.has_opaque() || self.fields.len() != 1 || other.fields.len() != 1 {
            return false;
        }
        let (Some((fa, ca)), Some((fb, cb))) = (self.fields.iter().next(), other.fields.iter().next()) else {
            return false;
        };
        if fa != fb {
            return false;
        }
        match (ca, cb) {
            (FieldConstraint::Range(a), FieldConstraint::Range(b)) => a.complements(b),
            (FieldConstraint::Text(a), FieldConstraint::Text(b)) => a.complements(b),
            _ => false,
        }
    }

    /// A canonical rendering, identical for equivalent expressions.
    #[must_use]
    pub fn canonical(&self) -> String {
        if self.unsatisfiable {
            return "false".to_string();
        }
        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|(name, c)| format!("{name} {c}"))
            .collect();
        parts.extend(self.opaque.iter().cloned());
        parts.join(" & ")
    }
}

fn parse_atom(text: &str) -> Option<(String, FieldConstraint)> {
    let caps = atom().captures(text)?;
    let field = normalize_term(caps.get(1)?.as_str());
    let op = caps.get(2)?.as_str();
    let raw_value = caps.get(3)?.as_str().trim();
    if field.is_empty() {
        return None;
    }

    let quoted = raw_value.len() >= 2
        && ((raw_value.starts_with('"') && raw_value.ends_with('"'))
            || (raw_value.starts_with('\'') && raw_value.ends_with('\'')));
    if !quoted {
        if let Ok(number) = raw_value.parse::<f64>() {
            if number.is_finite() {
                return Interval::from_op(op, number).map(|i| (field, FieldConstraint::Range(i)));
            }
        }
    }

    let value = if quoted { &raw_value[1..raw_value.len() - 1] } else { raw_value };
    if value.is_empty() || (!quoted && value.contains(char::is_whitespace)) {
        return None;
    }
    let value = value.to_lowercase();
    let set = BTreeSet::from([value]);
    match op {
        "==" | "=" => Some((field, FieldConstraint::Text(TextSet::Only(set)))),
        "!=" => Some((field, FieldConstraint::Text(TextSet::Except(set)))),
        _ => None,
    }
}

fn strip_parens(mut text: &str) -> &str {
    while text.starts_with('(') && text.ends_with(')') {
        let inner = &text[1..text.len() - 1];
        if inner.contains('(') || inner.contains(')') {
            break;
        }
        text = inner.trim();
    }
    text
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
