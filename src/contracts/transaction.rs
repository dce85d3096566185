//! Transaction contract
//!
//! Ledger-side program owning payment transaction records. Write acceptance
//! is gated on regime metadata (minimum-necessary, retention bounds) and on
//! the amount/resource invariants. The entity-to-transaction index lives in
//! the world state as composite keys written in the same invocation as the
//! primary record, so it survives replication across peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compliance::{all_passed, evaluate_all};
use crate::domain::{
    HistoryAction, HistoryEntry, PaymentTransaction, TransactionHistoryPage, TransactionStatus,
};

use super::state::{
    composite_key, get_json, next_sequence, put_json, sequence_part, ContractContext,
    ContractError, WorldState, TX_ENTITY_INDEX_NS, TX_HISTORY_NS, TX_NS, TX_SEQ_NS,
};

/// Filter and pagination options for transaction history queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQueryOptions {
    /// Inclusive lower bound on `created_at`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    /// Restrict to one status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TransactionStatus>,
    /// 1-based page number; 0 is treated as 1
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 200;

#[derive(Default)]
pub struct TransactionContract;

impl TransactionContract {
    /// Record a payment transaction.
    ///
    /// Every regime declaration is evaluated; a single failing check rejects
    /// the write with the evaluated outcomes in the rejection detail. On
    /// success the record is stored with its outcomes, a CREATE audit entry
    /// appended, and one index key written per referenced entity.
    pub fn record_transaction(
        &self,
        state: &mut dyn WorldState,
        ctx: &mut ContractContext,
        mut tx: PaymentTransaction,
    ) -> Result<PaymentTransaction, ContractError> {
        let key = composite_key(TX_NS, &[&tx.id.to_string()]);
        if state.get(&key).is_some() {
            return Err(ContractError::Duplicate(tx.id.to_string()));
        }

        if tx.resource_ids.is_empty() {
            return Err(ContractError::Validation(
                "resource_ids must be non-empty".to_string(),
            ));
        }
        if tx.amount_cents <= 0 {
            return Err(ContractError::Validation(
                "amount must be positive".to_string(),
            ));
        }
        if !tx.amount_matches_resources() {
            return Err(ContractError::Validation(format!(
                "amount {} does not equal unit price {} times {} resources",
                tx.amount_cents,
                tx.unit_price_cents,
                tx.resource_ids.len()
            )));
        }

        let checks = evaluate_all(&tx.regime_metadata);
        if !all_passed(&checks) {
            let failed: Vec<String> = checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| format!("{}: {}", c.regime, c.detail))
                .collect();
            return Err(ContractError::Validation(failed.join("; ")));
        }
        tx.compliance_checks = checks;

        tx.ledger_ref = Some(ctx.tx_id.clone());
        tx.created_at = ctx.timestamp;
        tx.updated_at = ctx.timestamp;
        tx.audit_trail = Vec::new();

        put_json(state, key, &tx)?;
        let entry = self.append_audit(
            state,
            ctx,
            tx.id,
            HistoryAction::Create,
            Some(format!(
                "{} recorded for {} resource(s)",
                tx.status,
                tx.resource_ids.len()
            )),
        )?;
        tx.audit_trail.push(entry);

        // Ledger-resident secondary index: one key per referenced entity,
        // written in the same invocation as the primary record.
        let tx_part = tx.id.to_string();
        for counterparty in &tx.counterparty_ids {
            self.index_entity(state, &counterparty.to_string(), &tx_part)?;
        }
        for resource in &tx.resource_ids {
            self.index_entity(state, resource, &tx_part)?;
        }

        ctx.emit(
            "transaction.recorded",
            serde_json::json!({
                "id": tx.id,
                "amount_cents": tx.amount_cents,
                "status": tx.status,
            }),
        );

        Ok(tx)
    }

    /// Move a transaction to a new status (e.g. the refund path)
    pub fn update_status(
        &self,
        state: &mut dyn WorldState,
        ctx: &mut ContractContext,
        id: Uuid,
        new_status: TransactionStatus,
    ) -> Result<PaymentTransaction, ContractError> {
        let key = composite_key(TX_NS, &[&id.to_string()]);
        let mut tx: PaymentTransaction =
            get_json(state, &key)?.ok_or_else(|| ContractError::NotFound(id.to_string()))?;

        if !tx.status.can_transition_to(new_status) {
            return Err(ContractError::InvalidTransition {
                from: tx.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let previous = tx.status;
        tx.status = new_status;
        tx.updated_at = ctx.timestamp;
        tx.ledger_ref = Some(ctx.tx_id.clone());

        put_json(state, key, &tx)?;
        self.append_audit(
            state,
            ctx,
            id,
            HistoryAction::Update,
            Some(format!("{previous} -> {new_status}")),
        )?;
        tx.audit_trail = self.load_audit(state, id)?;

        ctx.emit(
            "transaction.status_updated",
            serde_json::json!({ "id": id, "from": previous, "to": new_status }),
        );

        Ok(tx)
    }

    /// Integrity probe used by the coordinator's post-submit verification
    pub fn verify_transaction(
        &self,
        state: &dyn WorldState,
        id: Uuid,
    ) -> Result<PaymentTransaction, ContractError> {
        let key = composite_key(TX_NS, &[&id.to_string()]);
        let mut tx: PaymentTransaction =
            get_json(state, &key)?.ok_or_else(|| ContractError::NotFound(id.to_string()))?;
        tx.audit_trail = self.load_audit(state, id)?;
        Ok(tx)
    }

    /// Filtered, paginated transaction history for one entity.
    ///
    /// Resolves the entity's transaction ids through the ledger-resident
    /// index, loads the records, filters by date range and status, and
    /// pages the result ordered by `created_at` then id.
    pub fn query_history(
        &self,
        state: &dyn WorldState,
        entity_id: &str,
        options: &HistoryQueryOptions,
    ) -> Result<TransactionHistoryPage, ContractError> {
        let prefix = composite_key(TX_ENTITY_INDEX_NS, &[entity_id]);
        let mut items = Vec::new();
        for (key, bytes) in state.range(&prefix) {
            let tx_id: String = serde_json::from_slice(&bytes)
                .map_err(|e| ContractError::State(format!("corrupt index at {key}: {e}")))?;
            let tx_key = composite_key(TX_NS, &[&tx_id]);
            let tx: PaymentTransaction = get_json(state, &tx_key)?
                .ok_or_else(|| ContractError::State(format!("dangling index entry {key}")))?;

            if let Some(from) = options.from {
                if tx.created_at < from {
                    continue;
                }
            }
            if let Some(to) = options.to {
                if tx.created_at > to {
                    continue;
                }
            }
            if let Some(status) = options.status {
                if tx.status != status {
                    continue;
                }
            }
            items.push(tx);
        }

        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let total = items.len() as u64;
        let page = options.page.max(1);
        let page_size = match options.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        let start = ((page - 1) * page_size) as usize;
        let items = if start >= items.len() {
            Vec::new()
        } else {
            items
                .into_iter()
                .skip(start)
                .take(page_size as usize)
                .collect()
        };

        Ok(TransactionHistoryPage {
            items,
            total,
            page,
            page_size,
        })
    }

    fn index_entity(
        &self,
        state: &mut dyn WorldState,
        entity_id: &str,
        tx_id: &str,
    ) -> Result<(), ContractError> {
        put_json(
            state,
            composite_key(TX_ENTITY_INDEX_NS, &[entity_id, tx_id]),
            &tx_id,
        )
    }

    fn append_audit(
        &self,
        state: &mut dyn WorldState,
        ctx: &ContractContext,
        id: Uuid,
        action: HistoryAction,
        detail: Option<String>,
    ) -> Result<HistoryEntry, ContractError> {
        let id_part = id.to_string();
        let sequence = next_sequence(state, TX_SEQ_NS, &id_part)?;
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
            composite_key(TX_HISTORY_NS, &[&id_part, &sequence_part(sequence)]),
            &entry,
        )?;
        Ok(entry)
    }

    fn load_audit(
        &self,
        state: &dyn WorldState,
        id: Uuid,
    ) -> Result<Vec<HistoryEntry>, ContractError> {
        let prefix = composite_key(TX_HISTORY_NS, &[&id.to_string()]);
        state
            .range(&prefix)
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| ContractError::State(format!("corrupt audit trail at {key}: {e}")))
            })
            .collect()
    }
}
