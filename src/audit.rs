//! Audit event emission
//!
//! Every coordinator mutation emits an audit event describing the final
//! state. Emission is best-effort: a sink failure is logged and swallowed,
//! never propagated — an abort must not fail because the audit write did.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use thiserror::Error;
use uuid::Uuid;

/// Audit actions emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ConsentCreated,
    ConsentUpdated,
    ConsentAccessed,
    TransactionRecorded,
    TransactionHistoryQueried,
    /// A ledger-confirmed write lost its local commit; operator re-sync
    /// required
    ReconcileNeeded,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::ConsentCreated => write!(f, "consent_created"),
            AuditAction::ConsentUpdated => write!(f, "consent_updated"),
            AuditAction::ConsentAccessed => write!(f, "consent_accessed"),
            AuditAction::TransactionRecorded => write!(f, "transaction_recorded"),
            AuditAction::TransactionHistoryQueried => write!(f, "transaction_history_queried"),
            AuditAction::ReconcileNeeded => write!(f, "reconcile_needed"),
        }
    }
}

/// One audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub resource_id: String,
    pub actor_id: String,
    pub metadata: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        resource_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            resource_id: resource_id.into(),
            actor_id: actor_id.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Sink write failure; callers treat it as non-fatal
#[derive(Error, Debug)]
#[error("audit sink error: {0}")]
pub struct AuditSinkError(pub String);

/// Destination for audit events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_event(&self, event: AuditEvent) -> Result<(), AuditSinkError>;
}

/// Emit an event, swallowing sink failures with a warning
pub async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    let action = event.action.clone();
    let resource_id = event.resource_id.clone();
    if let Err(e) = sink.log_event(event).await {
        tracing::warn!(
            action = %action,
            resource_id = %resource_id,
            error = %e,
            "audit event dropped"
        );
    }
}

/// Sink that writes events to the tracing subscriber
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_event(&self, event: AuditEvent) -> Result<(), AuditSinkError> {
        tracing::info!(
            action = %event.action,
            resource_id = %event.resource_id,
            actor_id = %event.actor_id,
            metadata = %event.metadata,
            "audit"
        );
        Ok(())
    }
}

/// PostgreSQL-backed audit sink
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the audit table and indexes if absent
    pub async fn initialize(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                action TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                metadata JSONB
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_log_resource \
             ON audit_log (resource_id, timestamp DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn log_event(&self, event: AuditEvent) -> Result<(), AuditSinkError> {
        sqlx::query(
            "INSERT INTO audit_log (id, timestamp, action, resource_id, actor_id, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.id)
        .bind(event.timestamp)
        .bind(event.action.to_string())
        .bind(&event.resource_id)
        .bind(&event.actor_id)
        .bind(sqlx::types::Json(&event.metadata))
        .execute(&self.pool)
        .await
        .map_err(|e| AuditSinkError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn log_event(&self, _event: AuditEvent) -> Result<(), AuditSinkError> {
            Err(AuditSinkError("sink down".to_string()))
        }
    }

    #[tokio::test]
    async fn emit_swallows_sink_failures() {
        // Must not panic or propagate
        emit(
            &FailingSink,
            AuditEvent::new(AuditAction::ConsentCreated, "res-1", "actor-1"),
        )
        .await;
    }

    #[tokio::test]
    async fn emit_forwards_to_sink() {
        let mut mock = MockAuditSink::new();
        mock.expect_log_event().times(1).returning(|_| Ok(()));

        emit(
            &mock,
            AuditEvent::new(AuditAction::TransactionRecorded, "res-2", "actor-1"),
        )
        .await;
    }

    #[tokio::test]
    async fn tracing_sink_accepts_events() {
        let event = AuditEvent::new(AuditAction::ConsentUpdated, "res-1", "actor-1")
            .metadata(serde_json::json!({ "from": "PENDING", "to": "ACTIVE" }));
        assert!(TracingAuditSink.log_event(event).await.is_ok());
    }
}
