//! ============================================================================
//! Graph Client - The single resilient path to the graph store
//! ============================================================================
//! Every graph-backed component goes through `GraphClient`:
//! - breaker check first (fail fast with `CircuitOpen`)
//! - pooled connection acquired with the caller's priority
//! - transient failures retried with exponential backoff and jitter
//! - permanent failures surfaced on the first attempt
//! ============================================================================

use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::breaker::CircuitBreaker;
use super::pool::{ConnectionPool, PoolStatus, Priority};
use super::retry::next_delay;
use super::statement::{QueryResult, Statement};
use super::transport::{AccessMode, FailureKind, GraphConnector};
use crate::config::{BreakerConfig, PoolConfig, RetryConfig};
use crate::error::{MemoryError, Result};

pub struct GraphClient {
    pool: ConnectionPool,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
}

impl GraphClient {
    /// Create a new client with its own pool and a shared breaker
    pub fn new(
        connector: Arc<dyn GraphConnector>,
        pool: PoolConfig,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            pool: ConnectionPool::new(connector, pool),
            breaker,
            retry,
        }
    }

    /// Create with a private breaker built from `breaker_config`
    pub fn with_configs(
        connector: Arc<dyn GraphConnector>,
        pool: PoolConfig,
        breaker_config: BreakerConfig,
        retry: RetryConfig,
    ) -> Self {
        Self::new(
            connector,
            pool,
            Arc::new(CircuitBreaker::new(breaker_config)),
            retry,
        )
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn endpoint(&self) -> String {
        self.pool.endpoint()
    }

    pub async fn execute_read(&self, statement: Statement) -> Result<QueryResult> {
        self.execute_one(AccessMode::Read, Priority::Foreground, statement)
            .await
    }

    pub async fn execute_write(&self, statement: Statement) -> Result<QueryResult> {
        self.execute_one(AccessMode::Write, Priority::Foreground, statement)
            .await
    }

    pub async fn execute_one(
        &self,
        mode: AccessMode,
        priority: Priority,
        statement: Statement,
    ) -> Result<QueryResult> {
        let mut results = self
            .execute_transaction(mode, priority, std::slice::from_ref(&statement))
            .await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Run `statements` as one transaction, returning one result per statement
    pub async fn execute_transaction(
        &self,
        mode: AccessMode,
        priority: Priority,
        statements: &[Statement],
    ) -> Result<Vec<QueryResult>> {
        let mut attempt: u32 = 0;

        loop {
            self.breaker.check()?;

            let (kind, error) = match self.pool.acquire(priority).await {
                // Pool exhaustion says nothing about the server's health
                Err(e @ MemoryError::ConnectionTimeout(_)) => (FailureKind::Transient, e),
                Err(e) if e.is_transient() && !self.pool.is_closed() => {
                    self.breaker.record_failure();
                    (FailureKind::Transient, e)
                }
                Err(e) => return Err(e),
                Ok(mut conn) => match conn.run(mode, statements).await {
                    Ok(results) => {
                        self.breaker.record_success();
                        if attempt > 0 {
                            debug!("Graph transaction succeeded on attempt {}", attempt + 1);
                        }
                        return Ok(results);
                    }
                    Err(e) if e.kind == FailureKind::Permanent => {
                        // The server answered; it is healthy
                        self.breaker.record_success();
                        return Err(e.into());
                    }
                    Err(e) => {
                        self.breaker.record_failure();
                        (e.kind, MemoryError::from(e))
                    }
                },
            };

            match next_delay(kind, attempt, &self.retry) {
                Some(delay) => {
                    warn!(
                        "Graph attempt {} failed ({:?}): {}; retrying in {:?}",
                        attempt + 1,
                        kind,
                        error,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(
                        "Graph transaction failed after {} attempt(s): {}",
                        attempt + 1,
                        error
                    );
                    return Err(error);
                }
            }
        }
    }

    /// Cheap round trip used by health checks
    pub async fn ping(&self) -> Result<()> {
        self.execute_read(Statement::new("RETURN 1 AS ok")).await?;
        Ok(())
    }

    pub fn close(&self) {
        self.pool.close();
    }
}
