//! Policy types: the subject/resource/action/condition rules under analysis.
//!
//! Policies are produced by external scanners. This engine reads them, and the
//! only mutations it performs are supersession and the creation of unified
//! replacement policies during resolution.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::application::ApplicationId;
use crate::error::ValidationError;
use crate::severity::RiskLevel;

/// Unique identifier for a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(Uuid);

impl PolicyId {
    /// Creates a new random policy ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for PolicyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The decision a policy yields when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// Lifecycle status of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    #[default]
    Active,
    Inactive,
    Superseded,
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

/// A single authorization rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Generated when absent from imported records.
    #[serde(default)]
    pub id: PolicyId,

    /// Owning application; `None` for policies the scanner could not attribute.
    #[serde(default)]
    pub application_id: Option<ApplicationId>,

    /// Blank means no subject check.
    #[serde(default)]
    pub subject: String,
    pub resource: String,
    pub action: String,

    #[serde(default)]
    pub conditions: Option<String>,

    #[serde(default)]
    pub effect: Effect,

    #[serde(default)]
    pub risk_level: RiskLevel,

    #[serde(default)]
    pub status: PolicyStatus,

    /// Optimistic-concurrency token, bumped on every status change.
    #[serde(default = "initial_version")]
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<PolicyId>,

    /// Policies this one was merged or unified from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_from: Vec<PolicyId>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

const fn initial_version() -> u64 {
    1
}

impl Policy {
    /// Returns a builder for a new policy.
    #[must_use]
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::new()
    }

    /// Returns true if the policy participates in enforcement.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PolicyStatus::Active
    }

    /// Returns true if the policy has been superseded by a resolution.
    #[must_use]
    pub fn is_superseded(&self) -> bool {
        self.status == PolicyStatus::Superseded
    }

    /// Marks this policy as superseded and bumps its version.
    pub fn mark_superseded(&mut self, by: Option<PolicyId>) {
        self.status = PolicyStatus::Superseded;
        self.superseded_by = by;
        self.version = self.version.saturating_add(1);
    }

    /// Returns the subject/resource/action/conditions/effect of this policy.
    #[must_use]
    pub fn template(&self) -> PolicyTemplate {
        PolicyTemplate {
            subject: self.subject.clone(),
            resource: self.resource.clone(),
            action: self.action.clone(),
            conditions: self.conditions.clone(),
            effect: self.effect,
        }
    }
}

impl PartialEq for Policy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Policy {}

impl std::hash::Hash for Policy {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Builder for creating Policy instances.
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    id: Option<PolicyId>,
    application_id: Option<ApplicationId>,
    subject: Option<String>,
    resource: Option<String>,
    action: Option<String>,
    conditions: Option<String>,
    effect: Effect,
    risk_level: RiskLevel,
    derived_from: Vec<PolicyId>,
}

impl PolicyBuilder {
    /// Creates a new policy builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the policy ID (generated if not set).
    #[must_use]
    pub fn id(mut self, id: PolicyId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the owning application.
    #[must_use]
    pub fn application(mut self, application_id: impl Into<ApplicationId>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }

    /// Sets the owning application from an optional value.
    #[must_use]
    pub fn application_opt(mut self, application_id: Option<ApplicationId>) -> Self {
        self.application_id = application_id;
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    #[must_use]
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    #[must_use]
    pub fn conditions(mut self, conditions: impl Into<String>) -> Self {
        self.conditions = Some(conditions.into());
        self
    }

    #[must_use]
    pub fn effect(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }

    #[must_use]
    pub fn risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Records the policies this one replaces.
    #[must_use]
    pub fn derived_from(mut self, ids: Vec<PolicyId>) -> Self {
        self.derived_from = ids;
        self
    }

    /// Builds the Policy.
    ///
    /// Returns `ValidationError` if resource or action is missing or blank.
    /// A missing subject is allowed and means "no subject check".
    pub fn build(self) -> Result<Policy, ValidationError> {
        let resource = required(self.resource, "resource")?;
        let action = required(self.action, "action")?;
        let conditions = self
            .conditions
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        Ok(Policy {
            id: self.id.unwrap_or_default(),
            application_id: self.application_id,
            subject: self.subject.unwrap_or_default().trim().to_string(),
            resource,
            action,
            conditions,
            effect: self.effect,
            risk_level: self.risk_level,
            status: PolicyStatus::Active,
            version: initial_version(),
            superseded_by: None,
            derived_from: self.derived_from,
            created_at: Utc::now(),
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, ValidationError> {
    let value = value.ok_or_else(|| ValidationError::MissingField {
        field: field.to_string(),
    })?;
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::EmptyField {
            field: field.to_string(),
        });
    }
    Ok(value.to_string())
}

/// The application-independent shape of a policy.
///
/// Used for recommended unified policies and operator-authored resolutions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTemplate {
    pub subject: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub conditions: Option<String>,
    #[serde(default)]
    pub effect: Effect,
}

impl PolicyTemplate {
    /// Combines two policies into one definition.
    ///
    /// Subjects are unioned, conditions are kept when identical and otherwise
    /// joined as alternatives, and a disagreement on effect resolves to deny.
    #[must_use]
    pub fn merge(a: &Policy, b: &Policy) -> Self {
        let subject = if a.subject.trim().eq_ignore_ascii_case(b.subject.trim()) {
            a.subject.clone()
        } else if a.subject.trim().is_empty() || b.subject.trim().is_empty() {
            String::new()
        } else {
            format!("{} or {}", a.subject.trim(), b.subject.trim())
        };

        let conditions = match (a.conditions.as_deref(), b.conditions.as_deref()) {
            (Some(ca), Some(cb)) if ca.trim() == cb.trim() => Some(ca.trim().to_string()),
            (Some(ca), Some(cb)) => Some(format!("({}) or ({})", ca.trim(), cb.trim())),
            _ => None,
        };

        let effect = if a.effect == b.effect { a.effect } else { Effect::Deny };

        Self {
            subject,
            resource: a.resource.clone(),
            action: a.action.clone(),
            conditions,
            effect,
        }
    }

    /// Materializes this template as a new active policy.
    pub fn to_policy(
        &self,
        application_id: Option<ApplicationId>,
        risk_level: RiskLevel,
        derived_from: Vec<PolicyId>,
    ) -> Result<Policy, ValidationError> {
        let mut builder = Policy::builder()
            .application_opt(application_id)
            .subject(self.subject.clone())
            .resource(self.resource.clone())
            .action(self.action.clone())
            .effect(self.effect)
            .risk_level(risk_level)
            .derived_from(derived_from);
        if let Some(c) = &self.conditions {
            builder = builder.conditions(c.clone());
        }
        builder.build()
    }
}

impl fmt::Display for PolicyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subject = if self.subject.is_empty() { "*" } else { &self.subject };
        write!(f, "{} {} {} on {}", self.effect, subject, self.action, self.resource)?;
        if let Some(c) = &self.conditions {
            write!(f, " when {c}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_policy(effect: Effect) -> Policy {
        Policy::builder()
            .application("expenses")
            .subject("Manager")
            .resource("ExpenseReport")
            .action("approve")
            .conditions("amount < 5000")
            .effect(effect)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_success() {
        let p = manager_policy(Effect::Allow);
        assert!(p.is_active());
        assert_eq!(p.version, 1);
        assert_eq!(p.application_id, Some(ApplicationId::new("expenses")));
        assert_eq!(p.conditions.as_deref(), Some("amount < 5000"));
    }

    #[test]
    fn test_builder_missing_resource() {
        let result = Policy::builder().subject("Manager").action("approve").build();
        assert!(matches!(result, Err(ValidationError::MissingField { field }) if field == "resource"));
    }

    #[test]
    fn test_builder_blank_action_and_conditions() {
        let result = Policy::builder().resource("Invoice").action("  ").build();
        assert!(matches!(result, Err(ValidationError::EmptyField { .. })));

        let p = Policy::builder()
            .resource("Invoice")
            .action("read")
            .conditions("   ")
            .build()
            .unwrap();
        assert!(p.conditions.is_none());
        assert!(p.subject.is_empty());
    }

    #[test]
    fn test_mark_superseded_bumps_version() {
        let mut p = manager_policy(Effect::Allow);
        let by = PolicyId::new();
        p.mark_superseded(Some(by));
        assert!(p.is_superseded());
        assert!(!p.is_active());
        assert_eq!(p.version, 2);
        assert_eq!(p.superseded_by, Some(by));
    }

    #[test]
    fn test_merge_template_prefers_deny_on_disagreement() {
        let a = manager_policy(Effect::Allow);
        let b = manager_policy(Effect::Deny);
        let merged = PolicyTemplate::merge(&a, &b);
        assert_eq!(merged.effect, Effect::Deny);
        assert_eq!(merged.subject, "Manager");
        assert_eq!(merged.conditions.as_deref(), Some("amount < 5000"));
    }

    #[test]
    fn test_merge_template_unions_subjects() {
        let a = manager_policy(Effect::Allow);
        let mut b = manager_policy(Effect::Allow);
        b.subject = "Director".to_string();
        b.conditions = Some("amount < 10000".to_string());
        let merged = PolicyTemplate::merge(&a, &b);
        assert_eq!(merged.subject, "Manager or Director");
        assert_eq!(merged.conditions.as_deref(), Some("(amount < 5000) or (amount < 10000)"));
    }

    #[test]
    fn test_template_to_policy() {
        let template = manager_policy(Effect::Allow).template();
        let origin = PolicyId::new();
        let p = template
            .to_policy(Some(ApplicationId::new("crm")), RiskLevel::High, vec![origin])
            .unwrap();
        assert_eq!(p.application_id, Some(ApplicationId::new("crm")));
        assert_eq!(p.derived_from, vec![origin]);
        assert_eq!(p.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let json = r#"{
            "id": "6f1c1f2e-9a8b-4a53-9c35-0b5b2f0e5a11",
            "subject": "ADMIN",
            "resource": "CustomerPII",
            "action": "read"
        }"#;
        let p: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(p.effect, Effect::Allow);
        assert_eq!(p.status, PolicyStatus::Active);
        assert_eq!(p.version, 1);
        assert!(p.application_id.is_none());
    }
}
