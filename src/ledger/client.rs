//! Ledger client interface
//!
//! The ledger network is an external dependency reached through a narrow
//! client boundary: connect with a signing identity, then submit (ordered,
//! committed) or evaluate (read-only) named contract functions with JSON
//! arguments. [`InProcessLedger`] is the embedded runtime that executes the
//! contracts over an in-memory world state, used for development and tests
//! the way a lightweight local backend sits beside the production one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::contracts::{ContractContext, ContractError, ContractRouter, MemoryState};
use crate::vault::SigningIdentity;

/// Errors surfaced by ledger I/O
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// Call did not complete within its deadline
    #[error("ledger call timed out")]
    Timeout,

    /// Transport-level failure mid-call
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// Failed to establish a connection
    #[error("connect failed: {0}")]
    Connect(String),

    /// Connection pool exhausted within the checkout timeout
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Contract-level rejection; never retried
    #[error("rejected [{code}]: {message}")]
    Rejected { code: String, message: String },

    /// Malformed response or protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl LedgerError {
    /// Whether a retry may succeed. Rejections and protocol violations are
    /// deterministic and never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Timeout
            | LedgerError::ConnectionReset(_)
            | LedgerError::Connect(_)
            | LedgerError::PoolExhausted => true,
            LedgerError::Rejected { .. } | LedgerError::Protocol(_) => false,
        }
    }

    /// Whether the connection that produced this error should be discarded
    /// rather than returned to the pool
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            LedgerError::Timeout | LedgerError::ConnectionReset(_)
        )
    }
}

impl From<ContractError> for LedgerError {
    fn from(err: ContractError) -> Self {
        LedgerError::Rejected {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result of a committed submit
#[derive(Debug, Clone)]
pub struct LedgerResponse {
    /// Ledger transaction id assigned to the commit
    pub tx_id: String,
    /// Contract return value
    pub payload: serde_json::Value,
}

/// One open connection to the ledger network
#[async_trait]
pub trait LedgerConnection: Send + Sync {
    /// Invoke a state-mutating contract function and wait for commit
    async fn submit_transaction(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<LedgerResponse, LedgerError>;

    /// Invoke a read-only contract function
    async fn evaluate_transaction(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, LedgerError>;
}

/// Factory for ledger connections bound to a signing identity
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    async fn connect(
        &self,
        identity: &SigningIdentity,
    ) -> Result<Box<dyn LedgerConnection>, LedgerError>;
}

// ============================================================================
// In-process ledger runtime
// ============================================================================

/// Embedded ledger runtime executing the contracts over [`MemoryState`].
///
/// A submit executes the contract against a copy of the world state and
/// swaps the copy in only on success, so a failed invocation commits
/// nothing. All connections share one state.
pub struct InProcessLedger {
    state: Arc<Mutex<MemoryState>>,
    router: Arc<ContractRouter>,
}

impl Default for InProcessLedger {
    fn default() -> Self {
        Self::new(ContractRouter::default())
    }
}

impl InProcessLedger {
    pub fn new(router: ContractRouter) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::new())),
            router: Arc::new(router),
        }
    }

    /// Shared world state handle, for inspection in tests
    pub fn state(&self) -> Arc<Mutex<MemoryState>> {
        self.state.clone()
    }
}

#[async_trait]
impl LedgerConnector for InProcessLedger {
    async fn connect(
        &self,
        identity: &SigningIdentity,
    ) -> Result<Box<dyn LedgerConnection>, LedgerError> {
        Ok(Box::new(InProcessConnection {
            state: self.state.clone(),
            router: self.router.clone(),
            actor: identity.label.clone(),
        }))
    }
}

struct InProcessConnection {
    state: Arc<Mutex<MemoryState>>,
    router: Arc<ContractRouter>,
    actor: String,
}

#[async_trait]
impl LedgerConnection for InProcessConnection {
    async fn submit_transaction(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<LedgerResponse, LedgerError> {
        let mut shared = self.state.lock().await;
        let mut working = shared.clone();
        let mut ctx = ContractContext::new(Uuid::new_v4().to_string(), Utc::now(), &self.actor);

        let payload = self.router.submit(&mut working, &mut ctx, function, &args)?;

        *shared = working;
        for event in ctx.events() {
            tracing::debug!(
                event = %event.name,
                tx_id = %ctx.tx_id,
                "contract event emitted"
            );
        }

        Ok(LedgerResponse {
            tx_id: ctx.tx_id,
            payload,
        })
    }

    async fn evaluate_transaction(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, LedgerError> {
        let shared = self.state.lock().await;
        Ok(self.router.evaluate(&*shared, function, &args)?)
    }
}
