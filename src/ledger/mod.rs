//! Resilient ledger access
//!
//! - [`client`] - Connection traits, error classification, in-process runtime
//! - [`pool`] - Bounded connection pool with idle eviction
//! - [`circuit_breaker`] - Rolling-window breaker shared by all calls
//! - [`retry`] - Bounded exponential-backoff retry for transient errors
//! - [`gateway`] - The facade composing all of the above

pub mod circuit_breaker;
pub mod client;
pub mod gateway;
pub mod pool;
pub mod retry;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use client::{
    InProcessLedger, LedgerConnection, LedgerConnector, LedgerError, LedgerResponse,
};
pub use gateway::{GatewayConfig, LedgerGateway};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use retry::{run_with_retries, RetryConfig};
