//! Core domain types for the broker
//!
//! - [`consent`] - Consent records, permissions, and the status state machine
//! - [`transaction`] - Payment transactions and compliance regime metadata

mod consent;
mod transaction;

pub use consent::{
    AccessLevel, Consent, ConsentDraft, ConsentStatus, Constraints, HistoryAction, HistoryEntry,
    Permissions, ALLOWED_RESOURCE_TYPES, MIN_VALIDITY_HOURS,
};
pub use transaction::{
    ComplianceCheck, ComplianceRegime, LawfulBasis, PaymentTransaction, RegimeMetadata,
    TransactionHistoryPage, TransactionKind, TransactionStatus, GDPR_MAX_RETENTION_DAYS,
    HIPAA_MAX_RETENTION_DAYS,
};
