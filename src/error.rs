//! Broker error taxonomy.
//!
//! A single `thiserror` enum ([`BrokerError`]) plus a [`Result`] alias cover
//! the failure modes of spec.md §7. Boundary errors (the record store's
//! `sqlx::Error`, the vault's [`CredentialError`]) convert in via `#[from]`;
//! the coordinator maps ledger rejections onto the typed variants.

use thiserror::Error;
use uuid::Uuid;

use crate::compliance::RuleViolation;
use crate::vault::CredentialError;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Every way a broker operation can fail.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Compliance validation failed; carries the list of violated rules.
    /// Non-retryable.
    #[error("validation failed: {0:?}")]
    Validation(Vec<RuleViolation>),

    /// No entry exists for the requested id.
    #[error("entry not found: {0}")]
    NotFound(Uuid),

    /// The requested status transition is not permitted from the current
    /// status; no mutation occurs.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A read was attempted outside the entry's [valid_from, valid_to] window.
    #[error("temporal access denied for {id}")]
    TemporalAccess { id: Uuid },

    /// The ledger could not be reached (breaker open, timeout, connection
    /// failure). Potentially retryable at a higher layer.
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// The ledger contract rejected the call with a typed code and message.
    #[error("ledger rejected [{code}]: {message}")]
    LedgerRejected { code: String, message: String },

    /// An error surfaced at the record-store boundary.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A credential-vault operation failed.
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An invariant was violated internally (should not happen in normal
    /// operation).
    #[error("internal error: {0}")]
    Internal(String),
}
