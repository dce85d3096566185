//! In-memory record store for development and tests
//!
//! Transactions stage writes locally and apply them on commit under one
//! lock, so a commit is atomic and an abort leaves no trace. Operation
//! counters let tests assert exactly how much store I/O an operation
//! performed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{Consent, PaymentTransaction};
use crate::error::Result;

use super::{ConsentPage, RecordStore, RecordTxn};

/// Store operation counters
#[derive(Debug, Default)]
pub struct StoreStats {
    pub begun: AtomicU64,
    pub committed: AtomicU64,
    pub aborted: AtomicU64,
    pub saves: AtomicU64,
    pub reads: AtomicU64,
}

#[derive(Default)]
struct Tables {
    consents: HashMap<Uuid, Consent>,
    transactions: HashMap<Uuid, PaymentTransaction>,
}

/// In-memory implementation of [`RecordStore`]
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    tables: Arc<RwLock<Tables>>,
    stats: Arc<StoreStats>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordTxn>> {
        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTxn {
            tables: self.tables.clone(),
            stats: self.stats.clone(),
            staged_consents: Vec::new(),
            staged_transactions: Vec::new(),
        }))
    }

    async fn find_consent(&self, id: Uuid) -> Result<Option<Consent>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read().await;
        Ok(tables.consents.get(&id).cloned())
    }

    async fn list_consents(&self, subject_id: Uuid, page: u32, limit: u32) -> Result<ConsentPage> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read().await;

        let mut items: Vec<Consent> = tables
            .consents
            .values()
            .filter(|c| c.subject_id == subject_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = items.len() as u64;
        let page = page.max(1);
        let limit = limit.max(1);
        let start = ((page - 1) * limit) as usize;
        let items = if start >= items.len() {
            Vec::new()
        } else {
            items.into_iter().skip(start).take(limit as usize).collect()
        };

        Ok(ConsentPage { items, total })
    }

    async fn find_transaction(&self, id: Uuid) -> Result<Option<PaymentTransaction>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read().await;
        Ok(tables.transactions.get(&id).cloned())
    }
}

struct MemoryTxn {
    tables: Arc<RwLock<Tables>>,
    stats: Arc<StoreStats>,
    staged_consents: Vec<Consent>,
    staged_transactions: Vec<PaymentTransaction>,
}

#[async_trait]
impl RecordTxn for MemoryTxn {
    async fn save_consent(&mut self, consent: &Consent) -> Result<()> {
        self.stats.saves.fetch_add(1, Ordering::Relaxed);
        self.staged_consents.push(consent.clone());
        Ok(())
    }

    async fn save_transaction(&mut self, tx: &PaymentTransaction) -> Result<()> {
        self.stats.saves.fetch_add(1, Ordering::Relaxed);
        self.staged_transactions.push(tx.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.tables.write().await;
        for consent in self.staged_consents {
            tables.consents.insert(consent.id, consent);
        }
        for tx in self.staged_transactions {
            tables.transactions.insert(tx.id, tx);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.stats.aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::domain::{AccessLevel, ConsentStatus, Constraints, Permissions};

    fn consent_for(subject_id: Uuid, offset_mins: i64) -> Consent {
        let now = Utc::now() + Duration::minutes(offset_mins);
        Consent {
            id: Uuid::new_v4(),
            subject_id,
            counterparty_id: Uuid::new_v4(),
            request_id: "req".to_string(),
            permissions: Permissions {
                resource_types: ["Patient".to_string()].into_iter().collect(),
                access_level: AccessLevel::Read,
                data_elements: vec!["demographics".to_string()],
                purpose: "Care Coordination".to_string(),
                constraints: Constraints::default(),
            },
            valid_from: now,
            valid_to: now + Duration::hours(48),
            status: ConsentStatus::Pending,
            ledger_ref: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn commit_makes_writes_visible() {
        let store = MemoryRecordStore::new();
        let subject = Uuid::new_v4();
        let consent = consent_for(subject, 0);
        let id = consent.id;

        let mut txn = store.begin().await.unwrap();
        txn.save_consent(&consent).await.unwrap();
        assert!(store.find_consent(id).await.unwrap().is_none());

        txn.commit().await.unwrap();
        assert!(store.find_consent(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn abort_discards_writes() {
        let store = MemoryRecordStore::new();
        let consent = consent_for(Uuid::new_v4(), 0);
        let id = consent.id;

        let mut txn = store.begin().await.unwrap();
        txn.save_consent(&consent).await.unwrap();
        txn.abort().await.unwrap();

        assert!(store.find_consent(id).await.unwrap().is_none());
        assert_eq!(store.stats().aborted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn list_pages_newest_first() {
        let store = MemoryRecordStore::new();
        let subject = Uuid::new_v4();

        let mut txn = store.begin().await.unwrap();
        for i in 0..5 {
            txn.save_consent(&consent_for(subject, i)).await.unwrap();
        }
        txn.save_consent(&consent_for(Uuid::new_v4(), 0)).await.unwrap();
        txn.commit().await.unwrap();

        let page1 = store.list_consents(subject, 1, 2).await.unwrap();
        assert_eq!(page1.total, 5);
        assert_eq!(page1.items.len(), 2);
        assert!(page1.items[0].created_at > page1.items[1].created_at);

        let page3 = store.list_consents(subject, 3, 2).await.unwrap();
        assert_eq!(page3.items.len(), 1);

        let empty = store.list_consents(subject, 4, 2).await.unwrap();
        assert!(empty.items.is_empty());
        assert_eq!(empty.total, 5);
    }
}
