//! Consent records and the consent status state machine
//!
//! A consent is the subject's grant of access to a set of healthcare
//! resources for a bounded validity window. The local record store holds a
//! fast-read projection; the ledger holds the authoritative copy plus an
//! append-only history. Both copies carry the same logical shape.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resource types a consent may cover (FHIR resource vocabulary)
pub const ALLOWED_RESOURCE_TYPES: &[&str] = &[
    "Patient",
    "Observation",
    "Condition",
    "MedicationRequest",
    "Procedure",
    "DiagnosticReport",
    "Immunization",
    "AllergyIntolerance",
    "Encounter",
    "DocumentReference",
];

/// Minimum consent validity window in hours
pub const MIN_VALIDITY_HOURS: i64 = 24;

/// Access level granted by a consent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    Read,
    Write,
    Full,
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessLevel::Read => write!(f, "READ"),
            AccessLevel::Write => write!(f, "WRITE"),
            AccessLevel::Full => write!(f, "FULL"),
        }
    }
}

/// Usage constraints attached to a consent's permissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Free-form schedule restriction (e.g. "business-hours")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_restrictions: Option<String>,
    /// CIDR blocks the counterparty may access from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_restrictions: Vec<String>,
    /// Maximum number of accesses permitted under this consent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_limit: Option<u32>,
}

/// What a consent permits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    /// Resource types covered; must be a subset of [`ALLOWED_RESOURCE_TYPES`]
    pub resource_types: BTreeSet<String>,
    pub access_level: AccessLevel,
    /// Ordered list of data elements disclosed (e.g. "demographics")
    pub data_elements: Vec<String>,
    /// Stated purpose of use; must be non-empty
    pub purpose: String,
    #[serde(default)]
    pub constraints: Constraints,
}

/// Consent lifecycle status
///
/// Transitions are restricted to the allowed-transition table; REVOKED and
/// EXPIRED are terminal. The ledger contract is the final arbiter: a local
/// update that races to an invalid transition is rejected there and the
/// local transaction aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentStatus {
    Pending,
    Active,
    Revoked,
    Expired,
}

impl ConsentStatus {
    /// Statuses reachable from this one
    pub fn allowed_transitions(&self) -> &'static [ConsentStatus] {
        match self {
            ConsentStatus::Pending => &[ConsentStatus::Active, ConsentStatus::Revoked],
            ConsentStatus::Active => &[ConsentStatus::Revoked, ConsentStatus::Expired],
            ConsentStatus::Revoked | ConsentStatus::Expired => &[],
        }
    }

    pub fn can_transition_to(&self, next: ConsentStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn all() -> &'static [ConsentStatus] {
        &[
            ConsentStatus::Pending,
            ConsentStatus::Active,
            ConsentStatus::Revoked,
            ConsentStatus::Expired,
        ]
    }
}

impl std::fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsentStatus::Pending => write!(f, "PENDING"),
            ConsentStatus::Active => write!(f, "ACTIVE"),
            ConsentStatus::Revoked => write!(f, "REVOKED"),
            ConsentStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Action recorded in an append-only history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    Create,
    Update,
    Access,
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryAction::Create => write!(f, "CREATE"),
            HistoryAction::Update => write!(f, "UPDATE"),
            HistoryAction::Access => write!(f, "ACCESS"),
        }
    }
}

/// One entry in an entity's append-only ledger history
///
/// Entries are individually keyed on the ledger under
/// `(history namespace, entity id, sequence)`; the sequence is assigned
/// atomically with the write it documents, so concurrent appends cannot
/// clobber each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Monotonically increasing per-entity sequence, starting at 1
    pub sequence: u64,
    /// Ledger transaction id that produced this entry
    pub tx_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A consent record as held in both stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consent {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub counterparty_id: Uuid,
    pub request_id: String,
    pub permissions: Permissions,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub status: ConsentStatus,
    /// Opaque ledger transaction id; set only after the ledger write has
    /// been confirmed by a verification read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Consent {
    /// True while `at` lies inside the declared validity window (inclusive
    /// on both ends)
    pub fn is_within_validity_window(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && at <= self.valid_to
    }
}

/// Caller-supplied input to `create_consent`, before validation
///
/// Fields mirror the boundary payload: anything may be absent, and the
/// compliance validator reports missing required fields rather than the
/// deserializer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsentDraft {
    pub subject_id: Option<Uuid>,
    pub counterparty_id: Option<Uuid>,
    pub request_id: Option<String>,
    pub permissions: Option<Permissions>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl ConsentDraft {
    /// Materialize a PENDING consent record from a validated draft.
    ///
    /// Returns an error naming the missing field if the draft was not run
    /// through the compliance validator first.
    pub fn materialize(
        self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Consent, &'static str> {
        Ok(Consent {
            id,
            subject_id: self.subject_id.ok_or("subject_id")?,
            counterparty_id: self.counterparty_id.ok_or("counterparty_id")?,
            request_id: self.request_id.ok_or("request_id")?,
            permissions: self.permissions.ok_or("permissions")?,
            valid_from: self.valid_from.ok_or("valid_from")?,
            valid_to: self.valid_to.ok_or("valid_to")?,
            status: ConsentStatus::Pending,
            ledger_ref: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        })
    }
}
