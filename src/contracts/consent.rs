//! Consent contract
//!
//! Ledger-side program owning the authoritative consent copy. Enforces
//! write-time validation, the status transition table, temporal access
//! control on reads, and the append-only history. History entries are
//! individually keyed `(id, sequence)` so concurrent appends on different
//! peers cannot clobber one another.

use uuid::Uuid;

use crate::compliance::ComplianceValidator;
use crate::domain::{Consent, ConsentStatus, HistoryAction, HistoryEntry};

use super::state::{
    composite_key, get_json, next_sequence, put_json, sequence_part, ContractContext,
    ContractError, WorldState, CONSENT_HISTORY_NS, CONSENT_NS, CONSENT_SEQ_NS,
};

pub struct ConsentContract {
    validator: ComplianceValidator,
}

impl Default for ConsentContract {
    fn default() -> Self {
        Self {
            validator: ComplianceValidator::default(),
        }
    }
}

impl ConsentContract {
    pub fn new(validator: ComplianceValidator) -> Self {
        Self { validator }
    }

    /// Create a consent entry.
    ///
    /// Rejects a duplicate business id and any record failing the write-time
    /// validation rules. On success the record is stored under
    /// `(consent, id)` with `ledger_ref` set to the invocation's transaction
    /// id, a CREATE history entry is appended, and a domain event emitted.
    pub fn create_consent(
        &self,
        state: &mut dyn WorldState,
        ctx: &mut ContractContext,
        mut consent: Consent,
    ) -> Result<Consent, ContractError> {
        let key = composite_key(CONSENT_NS, &[&consent.id.to_string()]);
        if state.get(&key).is_some() {
            return Err(ContractError::Duplicate(consent.id.to_string()));
        }

        if consent.status != ConsentStatus::Pending {
            return Err(ContractError::Validation(format!(
                "new consent must be PENDING, got {}",
                consent.status
            )));
        }
        self.validator
            .validate_record(&consent)
            .map_err(|violations| {
                ContractError::Validation(
                    violations
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join("; "),
                )
            })?;

        consent.ledger_ref = Some(ctx.tx_id.clone());
        consent.created_at = ctx.timestamp;
        consent.updated_at = ctx.timestamp;
        consent.history = Vec::new();

        put_json(state, key, &consent)?;
        let entry = self.append_history(
            state,
            ctx,
            consent.id,
            HistoryAction::Create,
            Some(format!("created with status {}", consent.status)),
        )?;
        consent.history.push(entry);

        ctx.emit(
            "consent.created",
            serde_json::json!({
                "id": consent.id,
                "subject_id": consent.subject_id,
                "status": consent.status,
            }),
        );

        Ok(consent)
    }

    /// Move a consent to a new status.
    ///
    /// Rejects an unknown id and any transition outside the allowed table;
    /// on rejection no state is mutated.
    pub fn update_status(
        &self,
        state: &mut dyn WorldState,
        ctx: &mut ContractContext,
        id: Uuid,
        new_status: ConsentStatus,
    ) -> Result<Consent, ContractError> {
        let key = composite_key(CONSENT_NS, &[&id.to_string()]);
        let mut consent: Consent =
            get_json(state, &key)?.ok_or_else(|| ContractError::NotFound(id.to_string()))?;

        if !consent.status.can_transition_to(new_status) {
            return Err(ContractError::InvalidTransition {
                from: consent.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let previous = consent.status;
        consent.status = new_status;
        consent.updated_at = ctx.timestamp;
        consent.ledger_ref = Some(ctx.tx_id.clone());

        put_json(state, key, &consent)?;
        let entry = self.append_history(
            state,
            ctx,
            id,
            HistoryAction::Update,
            Some(format!("{previous} -> {new_status}")),
        )?;

        consent.history = self.load_history(state, id)?;
        debug_assert!(consent.history.last() == Some(&entry));

        ctx.emit(
            "consent.status_updated",
            serde_json::json!({
                "id": id,
                "from": previous,
                "to": new_status,
            }),
        );

        Ok(consent)
    }

    /// Read a consent with temporal access control.
    ///
    /// Rejects when the invocation timestamp lies outside
    /// `[valid_from, valid_to]` — the window applies even to reads. Every
    /// successful read appends an ACCESS history entry.
    pub fn get_consent(
        &self,
        state: &mut dyn WorldState,
        ctx: &mut ContractContext,
        id: Uuid,
    ) -> Result<Consent, ContractError> {
        let key = composite_key(CONSENT_NS, &[&id.to_string()]);
        let mut consent: Consent =
            get_json(state, &key)?.ok_or_else(|| ContractError::NotFound(id.to_string()))?;

        if !consent.is_within_validity_window(ctx.timestamp) {
            return Err(ContractError::TemporalAccess(id.to_string()));
        }

        self.append_history(state, ctx, id, HistoryAction::Access, None)?;
        consent.history = self.load_history(state, id)?;
        Ok(consent)
    }

    /// Integrity probe used by the coordinator's post-submit verification.
    ///
    /// Read-only: no temporal check, no history append. Confirms the record
    /// is retrievable and returns it with its history.
    pub fn verify_consent(
        &self,
        state: &dyn WorldState,
        id: Uuid,
    ) -> Result<Consent, ContractError> {
        let key = composite_key(CONSENT_NS, &[&id.to_string()]);
        let mut consent: Consent =
            get_json(state, &key)?.ok_or_else(|| ContractError::NotFound(id.to_string()))?;
        consent.history = self.load_history(state, id)?;
        Ok(consent)
    }

    fn append_history(
        &self,
        state: &mut dyn WorldState,
        ctx: &ContractContext,
        id: Uuid,
        action: HistoryAction,
        detail: Option<String>,
    ) -> Result<HistoryEntry, ContractError> {
        let id_part = id.to_string();
        let sequence = next_sequence(state, CONSENT_SEQ_NS, &id_part)?;
        let entry = HistoryEntry {
            sequence,
            tx_id: ctx.tx_id.clone(),
            timestamp: ctx.timestamp,
            action,
            actor: ctx.actor.clone(),
            detail,
        };
        put_json(
            state,
            composite_key(CONSENT_HISTORY_NS, &[&id_part, &sequence_part(sequence)]),
            &entry,
        )?;
        Ok(entry)
    }

    fn load_history(
        &self,
        state: &dyn WorldState,
        id: Uuid,
    ) -> Result<Vec<HistoryEntry>, ContractError> {
        let prefix = composite_key(CONSENT_HISTORY_NS, &[&id.to_string()]);
        state
            .range(&prefix)
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| ContractError::State(format!("corrupt history at {key}: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::contracts::state::MemoryState;
    use crate::domain::{AccessLevel, Constraints, Permissions};

    fn pending_consent(valid_from_offset_hours: i64) -> Consent {
        let now = Utc::now();
        Consent {
            id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            counterparty_id: Uuid::new_v4(),
            request_id: "req-001".to_string(),
            permissions: Permissions {
                resource_types: ["Patient".to_string()].into_iter().collect(),
                access_level: AccessLevel::Read,
                data_elements: vec!["demographics".to_string()],
                purpose: "Clinical Research".to_string(),
                constraints: Constraints::default(),
            },
            valid_from: now + Duration::hours(valid_from_offset_hours),
            valid_to: now + Duration::hours(valid_from_offset_hours + 48),
            status: ConsentStatus::Pending,
            ledger_ref: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    fn ctx() -> ContractContext {
        ContractContext::new(Uuid::new_v4().to_string(), Utc::now(), "test-client")
    }

    #[test]
    fn create_stamps_ledger_ref_and_history() {
        let contract = ConsentContract::default();
        let mut state = MemoryState::new();
        let mut ctx = ctx();

        let created = contract
            .create_consent(&mut state, &mut ctx, pending_consent(0))
            .unwrap();

        assert_eq!(created.ledger_ref.as_deref(), Some(ctx.tx_id.as_str()));
        assert_eq!(created.history.len(), 1);
        assert_eq!(created.history[0].action, HistoryAction::Create);
        assert_eq!(created.history[0].sequence, 1);
        assert_eq!(ctx.events().len(), 1);
    }

    #[test]
    fn duplicate_create_rejected() {
        let contract = ConsentContract::default();
        let mut state = MemoryState::new();
        let consent = pending_consent(0);

        contract
            .create_consent(&mut state, &mut ctx(), consent.clone())
            .unwrap();
        let err = contract
            .create_consent(&mut state, &mut ctx(), consent)
            .unwrap_err();
        assert!(matches!(err, ContractError::Duplicate(_)));
    }

    #[test]
    fn non_pending_create_rejected() {
        let contract = ConsentContract::default();
        let mut state = MemoryState::new();
        let mut consent = pending_consent(0);
        consent.status = ConsentStatus::Active;

        let err = contract
            .create_consent(&mut state, &mut ctx(), consent)
            .unwrap_err();
        assert!(matches!(err, ContractError::Validation(_)));
    }

    #[test]
    fn allowed_transition_appends_update_entry() {
        let contract = ConsentContract::default();
        let mut state = MemoryState::new();
        let consent = pending_consent(0);
        let id = consent.id;

        contract
            .create_consent(&mut state, &mut ctx(), consent)
            .unwrap();
        let updated = contract
            .update_status(&mut state, &mut ctx(), id, ConsentStatus::Active)
            .unwrap();

        assert_eq!(updated.status, ConsentStatus::Active);
        assert_eq!(updated.history.len(), 2);
        assert_eq!(updated.history[1].action, HistoryAction::Update);
        assert_eq!(updated.history[1].sequence, 2);
    }

    #[test]
    fn disallowed_transition_leaves_state_untouched() {
        let contract = ConsentContract::default();
        let mut state = MemoryState::new();
        let consent = pending_consent(0);
        let id = consent.id;

        contract
            .create_consent(&mut state, &mut ctx(), consent)
            .unwrap();
        let before = state.clone();

        let err = contract
            .update_status(&mut state, &mut ctx(), id, ConsentStatus::Expired)
            .unwrap_err();
        assert!(matches!(err, ContractError::InvalidTransition { .. }));
        assert_eq!(state.len(), before.len());

        let stored = contract.verify_consent(&state, id).unwrap();
        assert_eq!(stored.status, ConsentStatus::Pending);
        assert_eq!(stored.history.len(), 1);
    }

    #[test]
    fn unknown_id_rejected() {
        let contract = ConsentContract::default();
        let mut state = MemoryState::new();
        let err = contract
            .update_status(&mut state, &mut ctx(), Uuid::new_v4(), ConsentStatus::Active)
            .unwrap_err();
        assert!(matches!(err, ContractError::NotFound(_)));
    }

    #[test]
    fn read_outside_window_denied() {
        let contract = ConsentContract::default();
        let mut state = MemoryState::new();
        // Window opens 24h from now
        let consent = pending_consent(24);
        let id = consent.id;

        contract
            .create_consent(&mut state, &mut ctx(), consent)
            .unwrap();
        let err = contract
            .get_consent(&mut state, &mut ctx(), id)
            .unwrap_err();
        assert!(matches!(err, ContractError::TemporalAccess(_)));

        // The denied read must not have left an ACCESS entry behind
        let stored = contract.verify_consent(&state, id).unwrap();
        assert_eq!(stored.history.len(), 1);
    }

    #[test]
    fn read_inside_window_appends_access_entry() {
        let contract = ConsentContract::default();
        let mut state = MemoryState::new();
        let consent = pending_consent(0);
        let id = consent.id;

        contract
            .create_consent(&mut state, &mut ctx(), consent)
            .unwrap();
        let read = contract.get_consent(&mut state, &mut ctx(), id).unwrap();

        assert_eq!(read.history.len(), 2);
        assert_eq!(read.history[1].action, HistoryAction::Access);
    }

    #[test]
    fn verify_does_not_touch_history() {
        let contract = ConsentContract::default();
        let mut state = MemoryState::new();
        let consent = pending_consent(0);
        let id = consent.id;

        contract
            .create_consent(&mut state, &mut ctx(), consent)
            .unwrap();
        contract.verify_consent(&state, id).unwrap();
        contract.verify_consent(&state, id).unwrap();

        let stored = contract.verify_consent(&state, id).unwrap();
        assert_eq!(stored.history.len(), 1);
    }
}
