//! Payment transactions and compliance regime metadata
//!
//! Transactions record the purchase of access to a set of resources under an
//! existing consent. Like consents, they are written to both stores and the
//! ledger copy carries an append-only audit trail. Regime metadata is a
//! closed set of typed variants validated at the boundary; there are no
//! free-form compliance payloads.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::HistoryEntry;

/// Longest retention a HIPAA disclosure record may declare (6 years)
pub const HIPAA_MAX_RETENTION_DAYS: u32 = 2190;

/// Longest retention a GDPR processing record may declare (3 years)
pub const GDPR_MAX_RETENTION_DAYS: u32 = 1095;

/// Payment transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Initiated,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn allowed_transitions(&self) -> &'static [TransactionStatus] {
        match self {
            TransactionStatus::Initiated => {
                &[TransactionStatus::Processing, TransactionStatus::Failed]
            }
            TransactionStatus::Processing => {
                &[TransactionStatus::Completed, TransactionStatus::Failed]
            }
            TransactionStatus::Completed => &[TransactionStatus::Refunded],
            TransactionStatus::Failed | TransactionStatus::Refunded => &[],
        }
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Initiated => write!(f, "INITIATED"),
            TransactionStatus::Processing => write!(f, "PROCESSING"),
            TransactionStatus::Completed => write!(f, "COMPLETED"),
            TransactionStatus::Failed => write!(f, "FAILED"),
            TransactionStatus::Refunded => write!(f, "REFUNDED"),
        }
    }
}

/// Whether the transaction was brokered through the marketplace or settled
/// directly between counterparties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Marketplace,
    Direct,
}

/// Compliance regime a check was evaluated under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceRegime {
    Hipaa,
    Gdpr,
}

impl std::fmt::Display for ComplianceRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplianceRegime::Hipaa => write!(f, "HIPAA"),
            ComplianceRegime::Gdpr => write!(f, "GDPR"),
        }
    }
}

/// GDPR Article 6 lawful basis for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LawfulBasis {
    Consent,
    Contract,
    LegalObligation,
    VitalInterests,
    PublicTask,
    LegitimateInterests,
}

/// Regime-specific metadata declared with a transaction
///
/// A closed, tagged set: each regime's requirements are explicit fields, and
/// the transaction contract rejects the write when a declaration fails its
/// regime's rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "regime", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeMetadata {
    Hipaa {
        /// Disclosure limited to the minimum necessary; must be true
        minimum_necessary: bool,
        /// Declared retention period; must not exceed
        /// [`HIPAA_MAX_RETENTION_DAYS`]
        retention_days: u32,
        /// PHI fields disclosed by this transaction
        #[serde(default)]
        phi_fields_disclosed: Vec<String>,
    },
    Gdpr {
        lawful_basis: LawfulBasis,
        /// Declared retention period; must not exceed
        /// [`GDPR_MAX_RETENTION_DAYS`]
        retention_days: u32,
        /// Whether data leaves the originating jurisdiction
        #[serde(default)]
        cross_border_transfer: bool,
    },
}

impl RegimeMetadata {
    pub fn regime(&self) -> ComplianceRegime {
        match self {
            RegimeMetadata::Hipaa { .. } => ComplianceRegime::Hipaa,
            RegimeMetadata::Gdpr { .. } => ComplianceRegime::Gdpr,
        }
    }
}

/// Outcome of evaluating one regime declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceCheck {
    pub regime: ComplianceRegime,
    pub passed: bool,
    pub detail: String,
}

/// A payment transaction as held in both stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub request_id: String,
    pub counterparty_ids: Vec<Uuid>,
    /// Resources purchased; must be non-empty
    pub resource_ids: BTreeSet<String>,
    pub kind: TransactionKind,
    /// Total amount in minor currency units; must be positive
    pub amount_cents: i64,
    /// Per-record price in minor units; for marketplace transactions
    /// `amount_cents` must equal `unit_price_cents * resource_ids.len()`
    pub unit_price_cents: i64,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_ref: Option<String>,
    /// Regime declarations submitted with the transaction
    #[serde(default)]
    pub regime_metadata: Vec<RegimeMetadata>,
    /// Evaluated outcomes, filled in by the transaction contract
    #[serde(default)]
    pub compliance_checks: Vec<ComplianceCheck>,
    #[serde(default)]
    pub audit_trail: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    /// Marketplace amount invariant: total equals per-record price times the
    /// number of resources
    pub fn amount_matches_resources(&self) -> bool {
        match self.kind {
            TransactionKind::Marketplace => {
                self.amount_cents == self.unit_price_cents * self.resource_ids.len() as i64
            }
            TransactionKind::Direct => true,
        }
    }
}

/// Page of transactions returned by a filtered history query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionHistoryPage {
    pub items: Vec<PaymentTransaction>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}
