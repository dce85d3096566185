//! Regime-specific transaction metadata rules
//!
//! Each supported regime is a typed variant with explicit requirements.
//! Evaluation never fails structurally; it produces a [`ComplianceCheck`]
//! outcome per declaration, and callers reject the write when any outcome
//! has `passed == false`.

use crate::domain::{
    ComplianceCheck, RegimeMetadata, GDPR_MAX_RETENTION_DAYS, HIPAA_MAX_RETENTION_DAYS,
};

/// Evaluate a single regime declaration
pub fn evaluate_regime(metadata: &RegimeMetadata) -> ComplianceCheck {
    match metadata {
        RegimeMetadata::Hipaa {
            minimum_necessary,
            retention_days,
            phi_fields_disclosed,
        } => {
            if !minimum_necessary {
                return ComplianceCheck {
                    regime: metadata.regime(),
                    passed: false,
                    detail: "disclosure not limited to the minimum necessary".to_string(),
                };
            }
            if *retention_days > HIPAA_MAX_RETENTION_DAYS {
                return ComplianceCheck {
                    regime: metadata.regime(),
                    passed: false,
                    detail: format!(
                        "retention of {retention_days} days exceeds the \
                         {HIPAA_MAX_RETENTION_DAYS}-day maximum"
                    ),
                };
            }
            ComplianceCheck {
                regime: metadata.regime(),
                passed: true,
                detail: format!(
                    "minimum necessary asserted; {} PHI field(s), retained {retention_days} days",
                    phi_fields_disclosed.len()
                ),
            }
        }
        RegimeMetadata::Gdpr {
            lawful_basis,
            retention_days,
            cross_border_transfer,
        } => {
            if *retention_days > GDPR_MAX_RETENTION_DAYS {
                return ComplianceCheck {
                    regime: metadata.regime(),
                    passed: false,
                    detail: format!(
                        "retention of {retention_days} days exceeds the \
                         {GDPR_MAX_RETENTION_DAYS}-day maximum"
                    ),
                };
            }
            ComplianceCheck {
                regime: metadata.regime(),
                passed: true,
                detail: format!(
                    "lawful basis {lawful_basis:?}, retained {retention_days} days{}",
                    if *cross_border_transfer {
                        ", cross-border"
                    } else {
                        ""
                    }
                ),
            }
        }
    }
}

/// Evaluate every declaration, in order
pub fn evaluate_all(metadata: &[RegimeMetadata]) -> Vec<ComplianceCheck> {
    metadata.iter().map(evaluate_regime).collect()
}

/// True when every evaluated check passed
pub fn all_passed(checks: &[ComplianceCheck]) -> bool {
    checks.iter().all(|c| c.passed)
}
