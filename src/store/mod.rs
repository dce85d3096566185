//! Local record store
//!
//! The mutable transactional store holding the fast-read projection of both
//! entities. The coordinator opens a transaction, writes tentatively, and
//! commits only after the ledger write is confirmed — so the store boundary
//! must support rollback on every failure path.
//!
//! Two implementations: PostgreSQL for production and an in-memory store for
//! development and tests.

mod memory;
mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Consent, PaymentTransaction};
use crate::error::Result;

pub use memory::{MemoryRecordStore, StoreStats};
pub use postgres::PgRecordStore;

/// One page of a subject's consents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentPage {
    pub items: Vec<Consent>,
    pub total: u64,
}

/// Transactional record store boundary
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Open a transaction; writes are invisible until commit
    async fn begin(&self) -> Result<Box<dyn RecordTxn>>;

    async fn find_consent(&self, id: Uuid) -> Result<Option<Consent>>;

    /// A subject's consents, newest first. `page` is 1-based.
    async fn list_consents(&self, subject_id: Uuid, page: u32, limit: u32) -> Result<ConsentPage>;

    async fn find_transaction(&self, id: Uuid) -> Result<Option<PaymentTransaction>>;
}

/// An open store transaction
#[async_trait]
pub trait RecordTxn: Send {
    /// Upsert a consent within this transaction
    async fn save_consent(&mut self, consent: &Consent) -> Result<()>;

    /// Upsert a transaction record within this transaction
    async fn save_transaction(&mut self, tx: &PaymentTransaction) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn abort(self: Box<Self>) -> Result<()>;
}
