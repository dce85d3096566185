//! Lifecycle coordinator
//!
//! Orchestrates every create/update/read across the record store and the
//! ledger. The ordering discipline is fixed: validate (fail fast, zero I/O
//! on failure), write tentatively inside a store transaction, submit to the
//! ledger through the gateway, verify the write is retrievable, and only
//! then commit locally. Any ledger-side failure aborts the open store
//! transaction — no local record survives an unconfirmed ledger write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::audit::{emit, AuditAction, AuditEvent, AuditSink};
use crate::cache::ConsentListCache;
use crate::compliance::{evaluate_all, ComplianceValidator, RuleViolation};
use crate::contracts::HistoryQueryOptions;
use crate::domain::{
    Consent, ConsentDraft, ConsentStatus, PaymentTransaction, TransactionHistoryPage,
    TransactionStatus,
};
use crate::error::{BrokerError, Result};
use crate::ledger::LedgerGateway;
use crate::store::{ConsentPage, RecordStore, RecordTxn};

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Actor recorded on audit events
    pub actor_id: String,
    /// TTL for cached consent list pages
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    /// Best-effort ledger verification of list reads; failures are logged,
    /// never propagated
    pub verify_reads: bool,
    /// Minimum consent validity window
    pub min_validity: chrono::Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            actor_id: "lifecycle-coordinator".to_string(),
            cache_ttl: Duration::from_secs(60),
            cache_max_entries: 1024,
            verify_reads: true,
            min_validity: chrono::Duration::hours(crate::domain::MIN_VALIDITY_HOURS),
        }
    }
}

/// Coordinator for consent and transaction lifecycles. Exclusively owns
/// write access to both entities.
pub struct LifecycleCoordinator {
    store: Arc<dyn RecordStore>,
    gateway: Arc<LedgerGateway>,
    audit: Arc<dyn AuditSink>,
    cache: ConsentListCache,
    validator: ComplianceValidator,
    config: CoordinatorConfig,
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<LedgerGateway>,
        audit: Arc<dyn AuditSink>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            audit,
            cache: ConsentListCache::new(config.cache_max_entries, config.cache_ttl),
            validator: ComplianceValidator::new(config.min_validity),
            config,
        }
    }

    pub fn cache(&self) -> &ConsentListCache {
        &self.cache
    }

    /// Create a consent: validate, tentatively write PENDING, submit to the
    /// ledger, verify, commit.
    pub async fn create_consent(&self, draft: ConsentDraft) -> Result<Consent> {
        self.validator
            .validate(&draft)
            .map_err(BrokerError::Validation)?;

        let consent = draft
            .materialize(Uuid::new_v4(), Utc::now())
            .map_err(|field| BrokerError::Internal(format!("unvalidated draft: missing {field}")))?;

        let mut txn = self.store.begin().await?;
        if let Err(e) = txn.save_consent(&consent).await {
            return Err(abort_with(txn, e).await);
        }

        let response = match self
            .gateway
            .submit("create_consent", json!({ "consent": consent }))
            .await
        {
            Ok(response) => response,
            Err(e) => return Err(abort_with(txn, e).await),
        };
        let confirmed: Consent = match parse_payload(response.payload) {
            Ok(confirmed) => confirmed,
            Err(e) => return Err(abort_with(txn, e).await),
        };

        // The write must be retrievable before anything commits locally
        if let Err(e) = self
            .gateway
            .query("verify_consent", json!({ "id": confirmed.id }))
            .await
        {
            return Err(abort_with(txn, e).await);
        }

        if let Err(e) = txn.save_consent(&confirmed).await {
            return Err(abort_with(txn, e).await);
        }
        if let Err(e) = txn.commit().await {
            self.reconcile_needed("consent", confirmed.id, confirmed.ledger_ref.as_deref())
                .await;
            return Err(e);
        }

        self.cache.invalidate_subject(confirmed.subject_id).await;
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditAction::ConsentCreated,
                confirmed.id.to_string(),
                &self.config.actor_id,
            )
            .metadata(json!({
                "subject_id": confirmed.subject_id,
                "status": confirmed.status,
                "ledger_ref": confirmed.ledger_ref,
            })),
        )
        .await;

        Ok(confirmed)
    }

    /// Move a consent to a new status under the allowed-transition table
    pub async fn update_consent_status(
        &self,
        id: Uuid,
        new_status: ConsentStatus,
    ) -> Result<Consent> {
        let current = self
            .store
            .find_consent(id)
            .await?
            .ok_or(BrokerError::NotFound(id))?;

        if !current.status.can_transition_to(new_status) {
            return Err(BrokerError::InvalidTransition {
                from: current.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let mut txn = self.store.begin().await?;

        let mut tentative = current.clone();
        tentative.status = new_status;
        tentative.updated_at = Utc::now();
        if let Err(e) = txn.save_consent(&tentative).await {
            return Err(abort_with(txn, e).await);
        }

        // The contract re-checks the transition and is the final arbiter
        // under concurrent updates; a rejection aborts the local write
        let response = match self
            .gateway
            .submit(
                "update_consent_status",
                json!({ "id": id, "status": new_status }),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => return Err(abort_with(txn, e).await),
        };
        let confirmed: Consent = match parse_payload(response.payload) {
            Ok(confirmed) => confirmed,
            Err(e) => return Err(abort_with(txn, e).await),
        };

        if let Err(e) = self
            .gateway
            .query("verify_consent", json!({ "id": id }))
            .await
        {
            return Err(abort_with(txn, e).await);
        }

        if let Err(e) = txn.save_consent(&confirmed).await {
            return Err(abort_with(txn, e).await);
        }
        if let Err(e) = txn.commit().await {
            self.reconcile_needed("consent", id, confirmed.ledger_ref.as_deref())
                .await;
            return Err(e);
        }

        self.cache.invalidate_subject(confirmed.subject_id).await;
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditAction::ConsentUpdated,
                id.to_string(),
                &self.config.actor_id,
            )
            .metadata(json!({
                "from": current.status,
                "to": confirmed.status,
                "ledger_ref": confirmed.ledger_ref,
            })),
        )
        .await;

        Ok(confirmed)
    }

    /// Read one consent with temporal access control. The ledger enforces
    /// the validity window and appends the ACCESS history entry.
    pub async fn get_consent(&self, id: Uuid) -> Result<Consent> {
        if self.store.find_consent(id).await?.is_none() {
            return Err(BrokerError::NotFound(id));
        }

        let response = self
            .gateway
            .submit("get_consent", json!({ "id": id }))
            .await
            .map_err(|e| map_read_rejection(e, id))?;
        let consent: Consent = parse_payload(response.payload)?;

        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditAction::ConsentAccessed,
                id.to_string(),
                &self.config.actor_id,
            )
            .metadata(json!({ "subject_id": consent.subject_id })),
        )
        .await;

        Ok(consent)
    }

    /// A subject's consents through the read-through cache.
    ///
    /// The local store is the authoritative read path; per-record ledger
    /// verification is best-effort and a failure only produces a warning.
    pub async fn get_user_consents(
        &self,
        subject_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<ConsentPage> {
        if let Some(cached) = self.cache.get(subject_id, page, limit).await {
            return Ok(cached);
        }

        let result = self.store.list_consents(subject_id, page, limit).await?;

        if self.config.verify_reads {
            for consent in &result.items {
                if let Err(e) = self
                    .gateway
                    .query("verify_consent", json!({ "id": consent.id }))
                    .await
                {
                    tracing::warn!(
                        consent_id = %consent.id,
                        error = %e,
                        "ledger verification of cached read failed"
                    );
                }
            }
        }

        self.cache
            .insert(subject_id, page, limit, result.clone())
            .await;
        Ok(result)
    }

    /// Record a payment transaction with the same ordering discipline as
    /// consent creation
    pub async fn record_transaction(&self, tx: PaymentTransaction) -> Result<()> {
        let mut violations: Vec<RuleViolation> = Vec::new();
        if tx.resource_ids.is_empty() {
            violations.push(RuleViolation::NoResources);
        }
        if tx.amount_cents <= 0 {
            violations.push(RuleViolation::NonPositiveAmount);
        } else if !tx.amount_matches_resources() {
            violations.push(RuleViolation::AmountMismatch);
        }
        for check in evaluate_all(&tx.regime_metadata) {
            if !check.passed {
                violations.push(RuleViolation::RegimeCheckFailed {
                    regime: check.regime.to_string(),
                    detail: check.detail,
                });
            }
        }
        if !violations.is_empty() {
            return Err(BrokerError::Validation(violations));
        }

        let mut tx = tx;
        tx.status = TransactionStatus::Initiated;
        tx.ledger_ref = None;
        tx.compliance_checks.clear();
        tx.audit_trail.clear();

        let mut txn = self.store.begin().await?;
        if let Err(e) = txn.save_transaction(&tx).await {
            return Err(abort_with(txn, e).await);
        }

        let response = match self
            .gateway
            .submit("record_transaction", json!({ "transaction": tx }))
            .await
        {
            Ok(response) => response,
            Err(e) => return Err(abort_with(txn, e).await),
        };
        let confirmed: PaymentTransaction = match parse_payload(response.payload) {
            Ok(confirmed) => confirmed,
            Err(e) => return Err(abort_with(txn, e).await),
        };

        if let Err(e) = self
            .gateway
            .query("verify_transaction", json!({ "id": confirmed.id }))
            .await
        {
            return Err(abort_with(txn, e).await);
        }

        if let Err(e) = txn.save_transaction(&confirmed).await {
            return Err(abort_with(txn, e).await);
        }
        if let Err(e) = txn.commit().await {
            self.reconcile_needed("transaction", confirmed.id, confirmed.ledger_ref.as_deref())
                .await;
            return Err(e);
        }

        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditAction::TransactionRecorded,
                confirmed.id.to_string(),
                &self.config.actor_id,
            )
            .metadata(json!({
                "amount_cents": confirmed.amount_cents,
                "resource_count": confirmed.resource_ids.len(),
                "ledger_ref": confirmed.ledger_ref,
            })),
        )
        .await;

        Ok(())
    }

    /// Filtered, paginated ledger history for one entity
    pub async fn query_transaction_history(
        &self,
        entity_id: &str,
        options: HistoryQueryOptions,
    ) -> Result<TransactionHistoryPage> {
        let value = self
            .gateway
            .query(
                "query_transaction_history",
                json!({ "entity_id": entity_id, "options": options }),
            )
            .await?;
        let page: TransactionHistoryPage = parse_payload(value)?;

        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditAction::TransactionHistoryQueried,
                entity_id,
                &self.config.actor_id,
            )
            .metadata(json!({ "total": page.total, "page": page.page })),
        )
        .await;

        Ok(page)
    }

    /// A ledger-confirmed write lost its local commit. There is no
    /// compensating ledger transaction; the confirmed ref is recorded for an
    /// idempotent operator re-sync.
    async fn reconcile_needed(&self, entity: &str, id: Uuid, ledger_ref: Option<&str>) {
        tracing::error!(
            entity = entity,
            id = %id,
            ledger_ref = ledger_ref.unwrap_or("<none>"),
            "local commit failed after ledger confirmation; reconciliation required"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::new(AuditAction::ReconcileNeeded, id.to_string(), &self.config.actor_id)
                .metadata(json!({ "entity": entity, "ledger_ref": ledger_ref })),
        )
        .await;
    }
}

/// Abort the open transaction, then hand back the original error. Abort
/// failures are logged, not propagated — the caller's error is the one that
/// matters.
async fn abort_with(txn: Box<dyn RecordTxn>, error: BrokerError) -> BrokerError {
    if let Err(abort_err) = txn.abort().await {
        tracing::error!(error = %abort_err, "store transaction abort failed");
    }
    error
}

fn parse_payload<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| BrokerError::Internal(format!("malformed ledger response: {e}")))
}

/// Map contract rejection codes on the read path onto their typed errors
fn map_read_rejection(error: BrokerError, id: Uuid) -> BrokerError {
    match &error {
        BrokerError::LedgerRejected { code, .. } if code == "TEMPORAL_ACCESS" => {
            BrokerError::TemporalAccess { id }
        }
        BrokerError::LedgerRejected { code, .. } if code == "NOT_FOUND" => {
            BrokerError::NotFound(id)
        }
        _ => error,
    }
}
