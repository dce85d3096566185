//! Bounded ledger connection pool
//!
//! Connections are bound to one signing identity and shared across callers.
//! Checkout blocks up to a timeout when the pool is exhausted, then fails.
//! Idle connections older than the configured age are evicted at checkout.
//! The checkout guard returns its connection to the pool on drop, on every
//! exit path; a caller that saw a transport failure discards the connection
//! instead so a broken session is never reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::vault::SigningIdentity;

use super::client::{LedgerConnection, LedgerConnector, LedgerError, LedgerResponse};

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections pre-established by [`ConnectionPool::warm_up`]
    pub min_size: usize,
    /// Hard cap on concurrently checked-out connections
    pub max_size: usize,
    /// How long checkout blocks when the pool is exhausted
    pub checkout_timeout: Duration,
    /// Idle connections older than this are evicted at checkout
    pub max_idle_age: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 8,
            checkout_timeout: Duration::from_secs(5),
            max_idle_age: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, max: usize) -> Self {
        self.max_size = max.max(1);
        self
    }

    pub fn with_min_size(mut self, min: usize) -> Self {
        self.min_size = min;
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn with_max_idle_age(mut self, age: Duration) -> Self {
        self.max_idle_age = age;
        self
    }
}

/// Pool counters
#[derive(Debug, Default)]
pub struct PoolStats {
    pub created: AtomicU64,
    pub reused: AtomicU64,
    pub returned: AtomicU64,
    pub discarded: AtomicU64,
    pub evicted: AtomicU64,
    pub checkout_timeouts: AtomicU64,
}

struct IdleConnection {
    conn: Box<dyn LedgerConnection>,
    idle_since: Instant,
}

struct PoolInner {
    connector: Arc<dyn LedgerConnector>,
    identity: SigningIdentity,
    config: PoolConfig,
    idle: Mutex<Vec<IdleConnection>>,
    permits: Arc<Semaphore>,
    stats: PoolStats,
}

/// Bounded pool of ledger connections for one signing identity
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn LedgerConnector>,
        identity: SigningIdentity,
        config: PoolConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                connector,
                identity,
                config,
                idle: Mutex::new(Vec::new()),
                permits,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Pre-establish `min_size` idle connections
    pub async fn warm_up(&self) -> Result<(), LedgerError> {
        let needed = {
            let idle = self.lock_idle();
            self.inner.config.min_size.saturating_sub(idle.len())
        };
        for _ in 0..needed {
            let conn = self
                .inner
                .connector
                .connect(&self.inner.identity)
                .await?;
            self.inner.stats.created.fetch_add(1, Ordering::Relaxed);
            self.lock_idle().push(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
        Ok(())
    }

    /// Check out a connection, blocking up to the checkout timeout
    pub async fn checkout(&self) -> Result<PooledConnection, LedgerError> {
        let permit = match timeout(
            self.inner.config.checkout_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(LedgerError::PoolExhausted),
            Err(_) => {
                self.inner
                    .stats
                    .checkout_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                return Err(LedgerError::PoolExhausted);
            }
        };

        let reusable = {
            let mut idle = self.lock_idle();
            let max_age = self.inner.config.max_idle_age;
            let before = idle.len();
            idle.retain(|c| c.idle_since.elapsed() <= max_age);
            let evicted = (before - idle.len()) as u64;
            if evicted > 0 {
                self.inner.stats.evicted.fetch_add(evicted, Ordering::Relaxed);
            }
            idle.pop()
        };

        let conn = match reusable {
            Some(idle) => {
                self.inner.stats.reused.fetch_add(1, Ordering::Relaxed);
                idle.conn
            }
            None => {
                let conn = self
                    .inner
                    .connector
                    .connect(&self.inner.identity)
                    .await?;
                self.inner.stats.created.fetch_add(1, Ordering::Relaxed);
                conn
            }
        };

        Ok(PooledConnection {
            pool: self.inner.clone(),
            conn: Some(conn),
            poisoned: false,
            _permit: permit,
        })
    }

    /// Close every idle connection. Checked-out connections are destroyed
    /// when their guards drop.
    pub async fn drain(&self) {
        let drained = {
            let mut idle = self.lock_idle();
            std::mem::take(&mut *idle)
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "drained idle ledger connections");
        }
    }

    pub fn idle_len(&self) -> usize {
        self.lock_idle().len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<IdleConnection>> {
        // Held only for push/pop; a poisoned lock means a panic mid-push,
        // where the vector is still structurally sound
        match self.inner.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// RAII checkout guard. Dropping returns the connection to the pool unless
/// it was marked poisoned.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Box<dyn LedgerConnection>>,
    poisoned: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("has_conn", &self.conn.is_some())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub async fn submit_transaction(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<LedgerResponse, LedgerError> {
        match &self.conn {
            Some(conn) => conn.submit_transaction(function, args).await,
            None => Err(LedgerError::ConnectionReset("connection taken".to_string())),
        }
    }

    pub async fn evaluate_transaction(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, LedgerError> {
        match &self.conn {
            Some(conn) => conn.evaluate_transaction(function, args).await,
            None => Err(LedgerError::ConnectionReset("connection taken".to_string())),
        }
    }

    /// Mark the connection broken; it will be destroyed instead of returned
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.poisoned {
                self.pool.stats.discarded.fetch_add(1, Ordering::Relaxed);
            } else {
                self.pool.stats.returned.fetch_add(1, Ordering::Relaxed);
                let mut idle = match self.pool.idle.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                idle.push(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
            }
        }
    }
}
