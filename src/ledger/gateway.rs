//! Ledger gateway
//!
//! Single entry point for all ledger I/O. Every call runs under the shared
//! resilience policy: the circuit breaker is consulted before any network
//! attempt, each attempt carries a fixed timeout that counts as a breaker
//! failure, and only transient errors are retried with backoff. Contract
//! rejections are a healthy round-trip: they never trip the breaker and are
//! never retried.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{BrokerError, Result};
use crate::vault::CredentialVault;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::client::{LedgerConnector, LedgerError, LedgerResponse};
use super::pool::{ConnectionPool, PoolConfig};
use super::retry::{run_with_retries, RetryConfig};

/// Configuration for the gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Vault label of the signing identity used for all connections
    pub identity_label: String,
    /// Fixed per-call deadline
    pub call_timeout: Duration,
    pub pool: PoolConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            identity_label: "broker-admin".to_string(),
            call_timeout: Duration::from_secs(10),
            pool: PoolConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of one gateway attempt, before retry classification
enum CallError {
    /// Breaker rejected the call before any I/O
    BreakerOpen,
    Ledger(LedgerError),
}

impl CallError {
    fn is_retryable(&self) -> bool {
        match self {
            CallError::BreakerOpen => false,
            CallError::Ledger(e) => e.is_transient(),
        }
    }

    fn into_broker_error(self) -> BrokerError {
        match self {
            CallError::BreakerOpen => {
                BrokerError::LedgerUnavailable("circuit breaker open".to_string())
            }
            CallError::Ledger(LedgerError::Rejected { code, message }) => {
                BrokerError::LedgerRejected { code, message }
            }
            CallError::Ledger(LedgerError::Protocol(message)) => {
                BrokerError::Internal(format!("ledger protocol error: {message}"))
            }
            CallError::Ledger(e) => BrokerError::LedgerUnavailable(e.to_string()),
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::BreakerOpen => write!(f, "circuit breaker open"),
            CallError::Ledger(e) => write!(f, "{e}"),
        }
    }
}

/// Resilient facade over the ledger network
pub struct LedgerGateway {
    pool: ConnectionPool,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl std::fmt::Debug for LedgerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerGateway")
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl LedgerGateway {
    /// Build a gateway whose connections sign with the vault identity named
    /// by `config.identity_label`
    pub async fn new(
        connector: Arc<dyn LedgerConnector>,
        vault: &CredentialVault,
        config: GatewayConfig,
    ) -> Result<Self> {
        let identity = vault.get(&config.identity_label).await?;
        Ok(Self {
            pool: ConnectionPool::new(connector, identity, config.pool),
            breaker: CircuitBreaker::new("ledger", config.breaker),
            retry: config.retry,
            call_timeout: config.call_timeout,
        })
    }

    /// Pre-establish the pool's minimum connections
    pub async fn connect(&self) -> Result<()> {
        self.pool
            .warm_up()
            .await
            .map_err(|e| BrokerError::LedgerUnavailable(e.to_string()))
    }

    /// Release idle connections
    pub async fn disconnect(&self) {
        self.pool.drain().await;
    }

    /// Invoke a state-mutating contract function
    pub async fn submit(&self, function: &str, args: serde_json::Value) -> Result<LedgerResponse> {
        run_with_retries(
            &self.retry,
            function,
            CallError::is_retryable,
            || self.attempt_submit(function, args.clone()),
        )
        .await
        .map_err(CallError::into_broker_error)
    }

    /// Invoke a read-only contract function
    pub async fn query(&self, function: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        run_with_retries(
            &self.retry,
            function,
            CallError::is_retryable,
            || self.attempt_query(function, args.clone()),
        )
        .await
        .map_err(CallError::into_broker_error)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn attempt_submit(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> std::result::Result<LedgerResponse, CallError> {
        if !self.breaker.try_acquire().await {
            return Err(CallError::BreakerOpen);
        }

        let mut conn = match self.pool.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                // The breaker slot was claimed; account for the failed
                // attempt so a half-open trial cannot leak
                self.breaker.record_failure().await;
                return Err(CallError::Ledger(e));
            }
        };

        match timeout(self.call_timeout, conn.submit_transaction(function, args)).await {
            Ok(Ok(response)) => {
                self.breaker.record_success().await;
                Ok(response)
            }
            Ok(Err(e)) => Err(self.classify_failure(&mut conn, e).await),
            Err(_) => {
                conn.poison();
                self.breaker.record_failure().await;
                Err(CallError::Ledger(LedgerError::Timeout))
            }
        }
    }

    async fn attempt_query(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, CallError> {
        if !self.breaker.try_acquire().await {
            return Err(CallError::BreakerOpen);
        }

        let mut conn = match self.pool.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                self.breaker.record_failure().await;
                return Err(CallError::Ledger(e));
            }
        };

        match timeout(self.call_timeout, conn.evaluate_transaction(function, args)).await {
            Ok(Ok(value)) => {
                self.breaker.record_success().await;
                Ok(value)
            }
            Ok(Err(e)) => Err(self.classify_failure(&mut conn, e).await),
            Err(_) => {
                conn.poison();
                self.breaker.record_failure().await;
                Err(CallError::Ledger(LedgerError::Timeout))
            }
        }
    }

    async fn classify_failure(
        &self,
        conn: &mut super::pool::PooledConnection,
        error: LedgerError,
    ) -> CallError {
        if error.poisons_connection() {
            conn.poison();
        }
        match &error {
            // A contract rejection is a completed round-trip; the service
            // is healthy and the breaker must not count it
            LedgerError::Rejected { .. } => self.breaker.record_success().await,
            _ => self.breaker.record_failure().await,
        }
        CallError::Ledger(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::ledger::circuit_breaker::BreakerState;
    use crate::ledger::client::LedgerConnection;
    use crate::vault::SigningIdentity;

    /// Connector whose connections fail a set number of times before
    /// succeeding, counting every attempt
    struct ScriptedConnector {
        attempts: Arc<AtomicU32>,
        failures_before_success: u32,
        error: fn() -> LedgerError,
    }

    struct ScriptedConnection {
        attempts: Arc<AtomicU32>,
        failures_before_success: u32,
        error: fn() -> LedgerError,
    }

    #[async_trait]
    impl LedgerConnection for ScriptedConnection {
        async fn submit_transaction(
            &self,
            _function: &str,
            _args: serde_json::Value,
        ) -> std::result::Result<LedgerResponse, LedgerError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err((self.error)())
            } else {
                Ok(LedgerResponse {
                    tx_id: "tx-ok".to_string(),
                    payload: serde_json::Value::Null,
                })
            }
        }

        async fn evaluate_transaction(
            &self,
            _function: &str,
            _args: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, LedgerError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err((self.error)())
            } else {
                Ok(serde_json::Value::Null)
            }
        }
    }

    #[async_trait]
    impl LedgerConnector for ScriptedConnector {
        async fn connect(
            &self,
            _identity: &SigningIdentity,
        ) -> std::result::Result<Box<dyn LedgerConnection>, LedgerError> {
            Ok(Box::new(ScriptedConnection {
                attempts: self.attempts.clone(),
                failures_before_success: self.failures_before_success,
                error: self.error,
            }))
        }
    }

    async fn gateway_with(
        failures_before_success: u32,
        error: fn() -> LedgerError,
        config: GatewayConfig,
    ) -> (LedgerGateway, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = Arc::new(ScriptedConnector {
            attempts: attempts.clone(),
            failures_before_success,
            error,
        });

        let vault = CredentialVault::new(CredentialVault::generate_key());
        vault
            .add(&config.identity_label, "cert", "key")
            .await
            .unwrap();

        let gateway = LedgerGateway::new(connector, &vault, config).await.unwrap();
        (gateway, attempts)
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            retry: RetryConfig::fast(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn transient_failures_retried_to_success() {
        let (gateway, attempts) = gateway_with(
            2,
            || LedgerError::ConnectionReset("rst".to_string()),
            test_config(),
        )
        .await;

        let response = gateway.submit("fn", serde_json::Value::Null).await.unwrap();
        assert_eq!(response.tx_id, "tx-ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejection_never_retried() {
        let (gateway, attempts) = gateway_with(
            u32::MAX,
            || LedgerError::Rejected {
                code: "VALIDATION".to_string(),
                message: "bad".to_string(),
            },
            test_config(),
        )
        .await;

        let err = gateway.submit("fn", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, BrokerError::LedgerRejected { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        // Rejections are healthy round-trips
        assert_eq!(gateway.breaker().state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_surfaces_unavailable() {
        let mut config = test_config();
        config.retry = RetryConfig::fast().with_max_retries(2);
        let (gateway, attempts) =
            gateway_with(u32::MAX, || LedgerError::Timeout, config).await;

        let err = gateway.submit("fn", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, BrokerError::LedgerUnavailable(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_breaker_blocks_without_network_io() {
        let mut config = test_config();
        config.retry = RetryConfig::fast().with_max_retries(0);
        config.breaker = CircuitBreakerConfig::default().with_failure_threshold(5);
        let (gateway, attempts) =
            gateway_with(u32::MAX, || LedgerError::Timeout, config).await;

        for _ in 0..5 {
            let err = gateway.submit("fn", serde_json::Value::Null).await.unwrap_err();
            assert!(matches!(err, BrokerError::LedgerUnavailable(_)));
        }
        assert_eq!(gateway.breaker().state().await, BreakerState::Open);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);

        // Sixth call fails immediately; no further attempt reaches the wire
        let err = gateway.submit("fn", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, BrokerError::LedgerUnavailable(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn call_timeout_counts_as_breaker_failure() {
        struct SlowConnector;
        struct SlowConnection;

        #[async_trait]
        impl LedgerConnection for SlowConnection {
            async fn submit_transaction(
                &self,
                _function: &str,
                _args: serde_json::Value,
            ) -> std::result::Result<LedgerResponse, LedgerError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(LedgerResponse {
                    tx_id: "late".to_string(),
                    payload: serde_json::Value::Null,
                })
            }

            async fn evaluate_transaction(
                &self,
                _function: &str,
                _args: serde_json::Value,
            ) -> std::result::Result<serde_json::Value, LedgerError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(serde_json::Value::Null)
            }
        }

        #[async_trait]
        impl LedgerConnector for SlowConnector {
            async fn connect(
                &self,
                _identity: &SigningIdentity,
            ) -> std::result::Result<Box<dyn LedgerConnection>, LedgerError> {
                Ok(Box::new(SlowConnection))
            }
        }

        let vault = CredentialVault::new(CredentialVault::generate_key());
        vault.add("broker-admin", "cert", "key").await.unwrap();

        let config = GatewayConfig {
            call_timeout: Duration::from_millis(20),
            retry: RetryConfig::fast().with_max_retries(0),
            breaker: CircuitBreakerConfig::default().with_failure_threshold(1),
            ..Default::default()
        };
        let gateway = LedgerGateway::new(Arc::new(SlowConnector), &vault, config)
            .await
            .unwrap();

        let err = gateway.submit("fn", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, BrokerError::LedgerUnavailable(_)));
        assert_eq!(gateway.breaker().state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn missing_identity_fails_construction() {
        let vault = CredentialVault::new(CredentialVault::generate_key());
        let connector = Arc::new(ScriptedConnector {
            attempts: Arc::new(AtomicU32::new(0)),
            failures_before_success: 0,
            error: || LedgerError::Timeout,
        });

        let err = LedgerGateway::new(connector, &vault, GatewayConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Credential(_)));
    }
}
