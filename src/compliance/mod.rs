//! Compliance rule evaluation
//!
//! Pure, deterministic rule checks with no I/O. The same rules gate both
//! sides of the sync: the coordinator runs them before touching the store or
//! the ledger, and the ledger contracts re-run them at write time.

mod regimes;
mod validator;

pub use regimes::{all_passed, evaluate_all, evaluate_regime};
pub use validator::{ComplianceValidator, RuleViolation};
