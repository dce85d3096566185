//! Consent field and validity-window validation

use std::collections::BTreeSet;

use chrono::Duration;
use thiserror::Error;

use crate::domain::{Consent, ConsentDraft, Permissions, ALLOWED_RESOURCE_TYPES, MIN_VALIDITY_HOURS};

/// A single violated compliance rule
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleViolation {
    #[error("required field missing: {0}")]
    MissingField(&'static str),

    #[error("required field empty: {0}")]
    EmptyField(&'static str),

    #[error("resource type not in allowed vocabulary: {0}")]
    DisallowedResourceType(String),

    #[error("valid_from must precede valid_to")]
    WindowInverted,

    #[error("validity window shorter than the {minimum_hours}h minimum")]
    WindowTooShort { minimum_hours: i64 },

    #[error("{regime} check failed: {detail}")]
    RegimeCheckFailed { regime: String, detail: String },

    #[error("resource_ids must be non-empty")]
    NoResources,

    #[error("amount must be positive")]
    NonPositiveAmount,

    #[error("amount does not equal unit price times resource count")]
    AmountMismatch,
}

/// Pure consent validation: required fields, permission completeness,
/// resource vocabulary, and validity-window bounds.
///
/// Checks run in order and short-circuit on structural failure: a missing
/// required field suppresses the permission checks, and missing permissions
/// suppress the vocabulary and window checks. Rule-level failures within a
/// stage are collected together.
#[derive(Debug, Clone)]
pub struct ComplianceValidator {
    min_validity: Duration,
    allowed_resources: BTreeSet<&'static str>,
}

impl Default for ComplianceValidator {
    fn default() -> Self {
        Self {
            min_validity: Duration::hours(MIN_VALIDITY_HOURS),
            allowed_resources: ALLOWED_RESOURCE_TYPES.iter().copied().collect(),
        }
    }
}

impl ComplianceValidator {
    pub fn new(min_validity: Duration) -> Self {
        Self {
            min_validity,
            ..Default::default()
        }
    }

    /// Validate a caller-supplied draft before any record exists
    pub fn validate(&self, draft: &ConsentDraft) -> Result<(), Vec<RuleViolation>> {
        // (a) structural presence
        let mut missing = Vec::new();
        if draft.subject_id.is_none() {
            missing.push(RuleViolation::MissingField("subject_id"));
        }
        if draft.counterparty_id.is_none() {
            missing.push(RuleViolation::MissingField("counterparty_id"));
        }
        if draft.request_id.is_none() {
            missing.push(RuleViolation::MissingField("request_id"));
        }
        if draft.permissions.is_none() {
            missing.push(RuleViolation::MissingField("permissions"));
        }
        if draft.valid_from.is_none() {
            missing.push(RuleViolation::MissingField("valid_from"));
        }
        if draft.valid_to.is_none() {
            missing.push(RuleViolation::MissingField("valid_to"));
        }
        let (permissions, valid_from, valid_to) =
            match (draft.permissions.as_ref(), draft.valid_from, draft.valid_to) {
                (Some(p), Some(f), Some(t)) if missing.is_empty() => (p, f, t),
                _ => return Err(missing),
            };

        // (b) permission completeness; structural like (a)
        let incomplete = Self::permission_completeness(permissions);
        if !incomplete.is_empty() {
            return Err(incomplete);
        }

        // (c)-(e) rule checks, collected together
        let mut violations = Vec::new();
        self.check_vocabulary(permissions, &mut violations);
        self.check_window(valid_from, valid_to, &mut violations);

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Re-validate a materialized record; used ledger-side so a write that
    /// bypassed the coordinator is still rejected by the contract.
    pub fn validate_record(&self, consent: &Consent) -> Result<(), Vec<RuleViolation>> {
        let incomplete = Self::permission_completeness(&consent.permissions);
        if !incomplete.is_empty() {
            return Err(incomplete);
        }

        let mut violations = Vec::new();
        if consent.request_id.is_empty() {
            violations.push(RuleViolation::EmptyField("request_id"));
        }
        self.check_vocabulary(&consent.permissions, &mut violations);
        self.check_window(consent.valid_from, consent.valid_to, &mut violations);

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn permission_completeness(permissions: &Permissions) -> Vec<RuleViolation> {
        let mut violations = Vec::new();
        if permissions.resource_types.is_empty() {
            violations.push(RuleViolation::EmptyField("permissions.resource_types"));
        }
        if permissions.data_elements.is_empty() {
            violations.push(RuleViolation::EmptyField("permissions.data_elements"));
        }
        if permissions.purpose.trim().is_empty() {
            violations.push(RuleViolation::EmptyField("permissions.purpose"));
        }
        violations
    }

    fn check_vocabulary(&self, permissions: &Permissions, violations: &mut Vec<RuleViolation>) {
        for resource_type in &permissions.resource_types {
            if !self.allowed_resources.contains(resource_type.as_str()) {
                violations.push(RuleViolation::DisallowedResourceType(resource_type.clone()));
            }
        }
    }

    fn check_window(
        &self,
        valid_from: chrono::DateTime<chrono::Utc>,
        valid_to: chrono::DateTime<chrono::Utc>,
        violations: &mut Vec<RuleViolation>,
    ) {
        if valid_from >= valid_to {
            violations.push(RuleViolation::WindowInverted);
        } else if valid_to - valid_from < self.min_validity {
            violations.push(RuleViolation::WindowTooShort {
                minimum_hours: self.min_validity.num_hours(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::domain::{AccessLevel, Constraints};

    fn valid_draft() -> ConsentDraft {
        let now = Utc::now();
        ConsentDraft {
            subject_id: Some(Uuid::new_v4()),
            counterparty_id: Some(Uuid::new_v4()),
            request_id: Some("req-001".to_string()),
            permissions: Some(Permissions {
                resource_types: ["Patient".to_string()].into_iter().collect(),
                access_level: AccessLevel::Read,
                data_elements: vec!["demographics".to_string()],
                purpose: "Clinical Research".to_string(),
                constraints: Constraints::default(),
            }),
            valid_from: Some(now),
            valid_to: Some(now + Duration::hours(48)),
        }
    }

    #[test]
    fn valid_draft_passes() {
        assert!(ComplianceValidator::default().validate(&valid_draft()).is_ok());
    }

    #[test]
    fn missing_fields_short_circuit_permission_checks() {
        let mut draft = valid_draft();
        draft.subject_id = None;
        draft.permissions.as_mut().unwrap().purpose = String::new();

        let violations = ComplianceValidator::default().validate(&draft).unwrap_err();
        assert_eq!(violations, vec![RuleViolation::MissingField("subject_id")]);
    }

    #[test]
    fn all_missing_fields_reported_together() {
        let violations = ComplianceValidator::default()
            .validate(&ConsentDraft::default())
            .unwrap_err();
        assert_eq!(violations.len(), 6);
    }

    #[test]
    fn disallowed_resource_type_rejected() {
        let mut draft = valid_draft();
        draft
            .permissions
            .as_mut()
            .unwrap()
            .resource_types
            .insert("Spaceship".to_string());

        let violations = ComplianceValidator::default().validate(&draft).unwrap_err();
        assert_eq!(
            violations,
            vec![RuleViolation::DisallowedResourceType("Spaceship".to_string())]
        );
    }

    #[test]
    fn inverted_window_rejected() {
        let mut draft = valid_draft();
        let now = Utc::now();
        draft.valid_from = Some(now + Duration::hours(48));
        draft.valid_to = Some(now);

        let violations = ComplianceValidator::default().validate(&draft).unwrap_err();
        assert_eq!(violations, vec![RuleViolation::WindowInverted]);
    }

    #[test]
    fn short_window_rejected() {
        let mut draft = valid_draft();
        let now = Utc::now();
        draft.valid_from = Some(now);
        draft.valid_to = Some(now + Duration::hours(23));

        let violations = ComplianceValidator::default().validate(&draft).unwrap_err();
        assert_eq!(
            violations,
            vec![RuleViolation::WindowTooShort { minimum_hours: 24 }]
        );
    }

    #[test]
    fn exactly_minimum_window_accepted() {
        let mut draft = valid_draft();
        let now = Utc::now();
        draft.valid_from = Some(now);
        draft.valid_to = Some(now + Duration::hours(24));

        assert!(ComplianceValidator::default().validate(&draft).is_ok());
    }
}
