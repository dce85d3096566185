//! Ledger-side contracts
//!
//! - [`state`] - World state interface, composite keys, invocation context
//! - [`consent`] - Consent contract (status state machine, temporal reads)
//! - [`transaction`] - Transaction contract (regime gating, entity index)
//!
//! [`ContractRouter`] is the explicit dispatch table the ledger runtime uses
//! to route an invocation to a contract method: function names map to typed
//! argument decoding and a method call, nothing is resolved by reflection.

pub mod consent;
pub mod state;
pub mod transaction;

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

pub use consent::ConsentContract;
pub use state::{
    composite_key, ContractContext, ContractError, ContractEvent, MemoryState,
    WorldState,
};
pub use transaction::{HistoryQueryOptions, TransactionContract};

use crate::domain::{Consent, ConsentStatus, PaymentTransaction, TransactionStatus};

/// Explicit function dispatch for both contracts
pub struct ContractRouter {
    consent: ConsentContract,
    transaction: TransactionContract,
}

impl Default for ContractRouter {
    fn default() -> Self {
        Self {
            consent: ConsentContract::default(),
            transaction: TransactionContract,
        }
    }
}

impl ContractRouter {
    pub fn new(consent: ConsentContract, transaction: TransactionContract) -> Self {
        Self {
            consent,
            transaction,
        }
    }

    /// Dispatch a state-mutating invocation
    pub fn submit(
        &self,
        state: &mut dyn WorldState,
        ctx: &mut ContractContext,
        function: &str,
        args: &Value,
    ) -> Result<Value, ContractError> {
        match function {
            "create_consent" => {
                let consent: Consent = decode_arg(args, "consent")?;
                encode(self.consent.create_consent(state, ctx, consent)?)
            }
            "update_consent_status" => {
                let id: Uuid = decode_arg(args, "id")?;
                let status: ConsentStatus = decode_arg(args, "status")?;
                encode(self.consent.update_status(state, ctx, id, status)?)
            }
            "get_consent" => {
                let id: Uuid = decode_arg(args, "id")?;
                encode(self.consent.get_consent(state, ctx, id)?)
            }
            "record_transaction" => {
                let tx: PaymentTransaction = decode_arg(args, "transaction")?;
                encode(self.transaction.record_transaction(state, ctx, tx)?)
            }
            "update_transaction_status" => {
                let id: Uuid = decode_arg(args, "id")?;
                let status: TransactionStatus = decode_arg(args, "status")?;
                encode(self.transaction.update_status(state, ctx, id, status)?)
            }
            other => Err(ContractError::BadRequest(format!(
                "unknown submit function: {other}"
            ))),
        }
    }

    /// Dispatch a read-only invocation
    pub fn evaluate(
        &self,
        state: &dyn WorldState,
        function: &str,
        args: &Value,
    ) -> Result<Value, ContractError> {
        match function {
            "verify_consent" => {
                let id: Uuid = decode_arg(args, "id")?;
                encode(self.consent.verify_consent(state, id)?)
            }
            "verify_transaction" => {
                let id: Uuid = decode_arg(args, "id")?;
                encode(self.transaction.verify_transaction(state, id)?)
            }
            "query_transaction_history" => {
                let entity_id: String = decode_arg(args, "entity_id")?;
                let options: HistoryQueryOptions = decode_arg(args, "options")?;
                encode(self.transaction.query_history(state, &entity_id, &options)?)
            }
            other => Err(ContractError::BadRequest(format!(
                "unknown evaluate function: {other}"
            ))),
        }
    }
}

fn decode_arg<T: DeserializeOwned>(args: &Value, field: &str) -> Result<T, ContractError> {
    let value = args
        .get(field)
        .ok_or_else(|| ContractError::BadRequest(format!("missing argument: {field}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ContractError::BadRequest(format!("invalid argument {field}: {e}")))
}

fn encode<T: serde::Serialize>(value: T) -> Result<Value, ContractError> {
    serde_json::to_value(value).map_err(|e| ContractError::State(format!("encode response: {e}")))
}
