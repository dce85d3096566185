//! PostgreSQL record store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{
    ComplianceCheck, Consent, ConsentStatus, HistoryEntry, PaymentTransaction, Permissions,
    RegimeMetadata, TransactionKind, TransactionStatus,
};
use crate::error::{BrokerError, Result};

use super::{ConsentPage, RecordStore, RecordTxn};

/// PostgreSQL implementation of [`RecordStore`]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if absent
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consents (
                id UUID PRIMARY KEY,
                subject_id UUID NOT NULL,
                counterparty_id UUID NOT NULL,
                request_id TEXT NOT NULL,
                permissions JSONB NOT NULL,
                valid_from TIMESTAMPTZ NOT NULL,
                valid_to TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                ledger_ref TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                history JSONB NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_consents_subject \
             ON consents (subject_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payment_transactions (
                id UUID PRIMARY KEY,
                request_id TEXT NOT NULL,
                counterparty_ids JSONB NOT NULL,
                resource_ids JSONB NOT NULL,
                kind TEXT NOT NULL,
                amount_cents BIGINT NOT NULL,
                unit_price_cents BIGINT NOT NULL,
                status TEXT NOT NULL,
                ledger_ref TEXT,
                regime_metadata JSONB NOT NULL DEFAULT '[]',
                compliance_checks JSONB NOT NULL DEFAULT '[]',
                audit_trail JSONB NOT NULL DEFAULT '[]',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordTxn>> {
        let txn = self.pool.begin().await?;
        Ok(Box::new(PgRecordTxn { txn }))
    }

    async fn find_consent(&self, id: Uuid) -> Result<Option<Consent>> {
        let row: Option<ConsentRow> = sqlx::query_as(
            "SELECT id, subject_id, counterparty_id, request_id, permissions, \
             valid_from, valid_to, status, ledger_ref, created_at, updated_at, history \
             FROM consents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConsentRow::into_consent).transpose()
    }

    async fn list_consents(&self, subject_id: Uuid, page: u32, limit: u32) -> Result<ConsentPage> {
        let page = page.max(1);
        let limit = limit.max(1);

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM consents WHERE subject_id = $1")
                .bind(subject_id)
                .fetch_one(&self.pool)
                .await?;

        let rows: Vec<ConsentRow> = sqlx::query_as(
            "SELECT id, subject_id, counterparty_id, request_id, permissions, \
             valid_from, valid_to, status, ledger_ref, created_at, updated_at, history \
             FROM consents WHERE subject_id = $1 \
             ORDER BY created_at DESC, id LIMIT $2 OFFSET $3",
        )
        .bind(subject_id)
        .bind(limit as i64)
        .bind(((page - 1) * limit) as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(ConsentRow::into_consent)
            .collect::<Result<Vec<_>>>()?;

        Ok(ConsentPage {
            items,
            total: total as u64,
        })
    }

    async fn find_transaction(&self, id: Uuid) -> Result<Option<PaymentTransaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(
            "SELECT id, request_id, counterparty_ids, resource_ids, kind, amount_cents, \
             unit_price_cents, status, ledger_ref, regime_metadata, compliance_checks, \
             audit_trail, created_at, updated_at \
             FROM payment_transactions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_transaction).transpose()
    }
}

struct PgRecordTxn {
    txn: Transaction<'static, Postgres>,
}

#[async_trait]
impl RecordTxn for PgRecordTxn {
    async fn save_consent(&mut self, consent: &Consent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO consents (id, subject_id, counterparty_id, request_id, permissions,
                valid_from, valid_to, status, ledger_ref, created_at, updated_at, history)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                ledger_ref = EXCLUDED.ledger_ref,
                updated_at = EXCLUDED.updated_at,
                history = EXCLUDED.history
            "#,
        )
        .bind(consent.id)
        .bind(consent.subject_id)
        .bind(consent.counterparty_id)
        .bind(&consent.request_id)
        .bind(Json(&consent.permissions))
        .bind(consent.valid_from)
        .bind(consent.valid_to)
        .bind(enum_to_str(&consent.status)?)
        .bind(consent.ledger_ref.as_deref())
        .bind(consent.created_at)
        .bind(consent.updated_at)
        .bind(Json(&consent.history))
        .execute(&mut *self.txn)
        .await?;
        Ok(())
    }

    async fn save_transaction(&mut self, tx: &PaymentTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_transactions (id, request_id, counterparty_ids, resource_ids,
                kind, amount_cents, unit_price_cents, status, ledger_ref, regime_metadata,
                compliance_checks, audit_trail, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                ledger_ref = EXCLUDED.ledger_ref,
                compliance_checks = EXCLUDED.compliance_checks,
                audit_trail = EXCLUDED.audit_trail,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tx.id)
        .bind(&tx.request_id)
        .bind(Json(&tx.counterparty_ids))
        .bind(Json(&tx.resource_ids))
        .bind(enum_to_str(&tx.kind)?)
        .bind(tx.amount_cents)
        .bind(tx.unit_price_cents)
        .bind(enum_to_str(&tx.status)?)
        .bind(tx.ledger_ref.as_deref())
        .bind(Json(&tx.regime_metadata))
        .bind(Json(&tx.compliance_checks))
        .bind(Json(&tx.audit_trail))
        .execute(&mut *self.txn)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.txn.rollback().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ConsentRow {
    id: Uuid,
    subject_id: Uuid,
    counterparty_id: Uuid,
    request_id: String,
    permissions: Json<Permissions>,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
    status: String,
    ledger_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    history: Json<Vec<HistoryEntry>>,
}

impl ConsentRow {
    fn into_consent(self) -> Result<Consent> {
        Ok(Consent {
            id: self.id,
            subject_id: self.subject_id,
            counterparty_id: self.counterparty_id,
            request_id: self.request_id,
            permissions: self.permissions.0,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            status: enum_from_str::<ConsentStatus>(&self.status)?,
            ledger_ref: self.ledger_ref,
            created_at: self.created_at,
            updated_at: self.updated_at,
            history: self.history.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    request_id: String,
    counterparty_ids: Json<Vec<Uuid>>,
    resource_ids: Json<std::collections::BTreeSet<String>>,
    kind: String,
    amount_cents: i64,
    unit_price_cents: i64,
    status: String,
    ledger_ref: Option<String>,
    regime_metadata: Json<Vec<RegimeMetadata>>,
    compliance_checks: Json<Vec<ComplianceCheck>>,
    audit_trail: Json<Vec<HistoryEntry>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_transaction(self) -> Result<PaymentTransaction> {
        Ok(PaymentTransaction {
            id: self.id,
            request_id: self.request_id,
            counterparty_ids: self.counterparty_ids.0,
            resource_ids: self.resource_ids.0,
            kind: enum_from_str::<TransactionKind>(&self.kind)?,
            amount_cents: self.amount_cents,
            unit_price_cents: self.unit_price_cents,
            status: enum_from_str::<TransactionStatus>(&self.status)?,
            ledger_ref: self.ledger_ref,
            regime_metadata: self.regime_metadata.0,
            compliance_checks: self.compliance_checks.0,
            audit_trail: self.audit_trail.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Serialize a unit enum to its serde string form for a TEXT column
fn enum_to_str<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(BrokerError::Internal(format!(
            "expected string-serializable enum, got {other}"
        ))),
        Err(e) => Err(BrokerError::Internal(format!("serialize enum: {e}"))),
    }
}

/// Parse a TEXT column back into a unit enum through its serde name
fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| BrokerError::Internal(format!("corrupt enum column '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_text_roundtrip() {
        assert_eq!(enum_to_str(&ConsentStatus::Pending).unwrap(), "PENDING");
        assert_eq!(
            enum_from_str::<ConsentStatus>("REVOKED").unwrap(),
            ConsentStatus::Revoked
        );
        assert_eq!(
            enum_to_str(&TransactionKind::Marketplace).unwrap(),
            "marketplace"
        );
        assert!(enum_from_str::<ConsentStatus>("pending").is_err());
    }
}
