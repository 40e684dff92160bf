//! ============================================================================
//! Connection Pool - Semaphore-bounded graph connections
//! ============================================================================
//! - At most `max_size` connections are checked out at once
//! - Idle connections are reused until they exceed `max_lifetime`
//! - `PooledConnection` returns itself on drop, unless it was cancelled
//!   mid-query or saw a transport failure, in which case it is discarded
//! - Background work only proceeds while `background_reserve` permits stay
//!   free for foreground requests
//! ============================================================================

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use super::statement::{QueryResult, Statement};
use super::transport::{AccessMode, GraphConnection, GraphConnector, TransportError};
use crate::config::PoolConfig;
use crate::error::{MemoryError, Result};

const BACKGROUND_POLL: Duration = Duration::from_millis(20);

/// Who is asking for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Live request traffic
    Foreground,
    /// Lifecycle sweeps and other maintenance
    Background,
}

struct IdleConnection {
    conn: Box<dyn GraphConnection>,
    created_at: Instant,
}

#[derive(Default)]
struct PoolCounters {
    opened: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub available: usize,
    pub idle: usize,
    pub opened: u64,
    pub reused: u64,
    pub discarded: u64,
}

/// Bounded pool of graph connections
pub struct ConnectionPool {
    connector: Arc<dyn GraphConnector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<IdleConnection>>>,
    counters: Arc<PoolCounters>,
}

impl ConnectionPool {
    /// Create a new pool; no connection is opened until the first acquire
    pub fn new(connector: Arc<dyn GraphConnector>, config: PoolConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_size)),
            connector,
            config,
            idle: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Check out a connection, waiting at most `acquire_timeout`
    pub async fn acquire(&self, priority: Priority) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        let permit = match priority {
            Priority::Foreground => {
                match timeout(self.config.acquire_timeout, self.permits.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(MemoryError::Connection("connection pool closed".into())),
                    Err(_) => return Err(MemoryError::ConnectionTimeout(self.config.acquire_timeout)),
                }
            }
            Priority::Background => self.acquire_background(deadline).await?,
        };

        if let Some(idle) = self.take_idle() {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(self.wrap(idle.conn, idle.created_at, permit));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let conn = match timeout(remaining, self.connector.connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(MemoryError::ConnectionTimeout(self.config.acquire_timeout)),
        };
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        debug!("Opened pooled connection to {}", self.connector.endpoint());

        Ok(self.wrap(conn, Instant::now(), permit))
    }

    async fn acquire_background(&self, deadline: Instant) -> Result<OwnedSemaphorePermit> {
        loop {
            if self.permits.is_closed() {
                return Err(MemoryError::Connection("connection pool closed".into()));
            }
            if self.permits.available_permits() > self.config.background_reserve {
                if let Ok(permit) = self.permits.clone().try_acquire_owned() {
                    return Ok(permit);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Background acquisition refused: {} of {} permits free, {} reserved",
                    self.permits.available_permits(),
                    self.config.max_size,
                    self.config.background_reserve
                );
                return Err(MemoryError::ConnectionTimeout(self.config.acquire_timeout));
            }
            sleep(BACKGROUND_POLL.min(deadline - now)).await;
        }
    }

    fn take_idle(&self) -> Option<IdleConnection> {
        let mut idle = self.idle.lock();
        while let Some(candidate) = idle.pop() {
            if candidate.created_at.elapsed() < self.config.max_lifetime {
                return Some(candidate);
            }
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding expired idle connection");
        }
        None
    }

    fn wrap(
        &self,
        conn: Box<dyn GraphConnection>,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            created_at,
            max_lifetime: self.config.max_lifetime,
            in_flight: false,
            broken: false,
            idle: self.idle.clone(),
            counters: self.counters.clone(),
            _permit: permit,
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_size: self.config.max_size,
            available: self.permits.available_permits(),
            idle: self.idle.lock().len(),
            opened: self.counters.opened.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Refuse new acquisitions and drop idle connections
    pub fn close(&self) {
        self.permits.close();
        self.idle.lock().clear();
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn GraphConnection>>,
    created_at: Instant,
    max_lifetime: Duration,
    in_flight: bool,
    broken: bool,
    idle: Arc<Mutex<Vec<IdleConnection>>>,
    counters: Arc<PoolCounters>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub async fn run(
        &mut self,
        mode: AccessMode,
        statements: &[Statement],
    ) -> std::result::Result<Vec<QueryResult>, TransportError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| TransportError::transient("Mainza.Pool", "connection already released"))?;

        self.in_flight = true;
        let result = conn.run(mode, statements).await;
        self.in_flight = false;

        if let Err(e) = &result {
            if e.is_retryable() {
                self.broken = true;
            }
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.in_flight || self.broken || self.created_at.elapsed() >= self.max_lifetime {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            if self.in_flight {
                debug!("Discarding connection cancelled mid-query");
            }
            return;
        }
        self.idle.lock().push(IdleConnection {
            conn,
            created_at: self.created_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::ScriptedConnector;

    fn pool_with(connector: Arc<ScriptedConnector>, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(connector, config)
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            max_size: 2,
            max_lifetime: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(60),
            background_reserve: 1,
        }
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let connector = Arc::new(ScriptedConnector::new());
        let pool = pool_with(connector.clone(), small_config());

        {
            let mut conn = pool.acquire(Priority::Foreground).await.unwrap();
            conn.run(AccessMode::Read, &[Statement::new("RETURN 1")]).await.unwrap();
        }
        {
            let _conn = pool.acquire(Priority::Foreground).await.unwrap();
        }

        let status = pool.status();
        assert_eq!(status.opened, 1);
        assert_eq!(status.reused, 1);
        assert_eq!(status.available, 2);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let connector = Arc::new(ScriptedConnector::new());
        let pool = pool_with(connector, small_config());

        let _a = pool.acquire(Priority::Foreground).await.unwrap();
        let _b = pool.acquire(Priority::Foreground).await.unwrap();

        match pool.acquire(Priority::Foreground).await {
            Err(MemoryError::ConnectionTimeout(d)) => assert_eq!(d, Duration::from_millis(60)),
            Err(other) => panic!("expected timeout, got {:?}", other),
            Ok(_) => panic!("expected timeout, got a connection"),
        }
    }

    #[tokio::test]
    async fn test_background_respects_reserve() {
        let connector = Arc::new(ScriptedConnector::new());
        let pool = pool_with(connector, small_config());

        let held = pool.acquire(Priority::Foreground).await.unwrap();
        // One permit left, and it is reserved for foreground work
        assert!(matches!(
            pool.acquire(Priority::Background).await,
            Err(MemoryError::ConnectionTimeout(_))
        ));
        assert!(pool.acquire(Priority::Foreground).await.is_ok());

        drop(held);
        assert!(pool.acquire(Priority::Background).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_connections_are_discarded() {
        let connector = Arc::new(ScriptedConnector::new());
        let config = PoolConfig {
            max_lifetime: Duration::from_millis(0),
            ..small_config()
        };
        let pool = pool_with(connector.clone(), config);

        drop(pool.acquire(Priority::Foreground).await.unwrap());
        drop(pool.acquire(Priority::Foreground).await.unwrap());

        assert_eq!(connector.connects(), 2);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_failed_connection_not_returned() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.fail_next(TransportError::transient("Mainza.Connect", "reset"));
        let pool = pool_with(connector.clone(), small_config());

        {
            let mut conn = pool.acquire(Priority::Foreground).await.unwrap();
            assert!(conn.run(AccessMode::Write, &[Statement::new("RETURN 1")]).await.is_err());
        }
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().available, 2);
    }

    #[tokio::test]
    async fn test_cancelled_query_discards_connection() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_latency(Duration::from_millis(200));
        let pool = pool_with(connector, small_config());

        {
            let mut conn = pool.acquire(Priority::Foreground).await.unwrap();
            let stmts = [Statement::new("RETURN 1")];
            let run = conn.run(AccessMode::Read, &stmts);
            assert!(timeout(Duration::from_millis(10), run).await.is_err());
        }

        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.discarded, 1);
        assert_eq!(status.available, 2);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses() {
        let pool = pool_with(Arc::new(ScriptedConnector::new()), small_config());
        pool.close();
        assert!(matches!(
            pool.acquire(Priority::Foreground).await,
            Err(MemoryError::Connection(_))
        ));
    }
}
