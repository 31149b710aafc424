//! Connection pool for a single node
//!
//! - Configurable min/max sizes with acquire, connect and idle timeouts
//! - Semaphore-based concurrency control (waiters are counted for stats)
//! - Validation on borrow, lifetime/idle recycling
//! - Connections that fail with a connection error are discarded on return
//! - Lazy: no connection is opened until the first borrow, so a node that is
//!   down at registration time can still be added and probed later
//!
//! # Example
//!
//! ```rust,ignore
//! let pool = ConnectionPool::new(
//!     PoolConfig::default().with_max_size(4),
//!     ConnectionConfig::new("db1", "app"),
//!     Arc::new(PgConnectionFactory),
//! );
//!
//! let conn = pool.get().await?;
//! conn.query("SELECT 1", &[]).await?;
//! // Connection is returned to the pool when dropped
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, ErrorCategory, Result};
use crate::types::{Row, Value};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept open by the reaper
    pub min_size: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a free slot
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 5,
            acquire_timeout: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            idle_timeout: Duration::from_secs(30),
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    /// Validate sizes
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(Error::config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Open connections (idle + borrowed)
    pub total: usize,
    /// Connections sitting idle in the pool
    pub idle: usize,
    /// Callers waiting for a free slot
    pub waiting: usize,
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of successful acquisitions
    pub acquisitions: u64,
    /// Number of times an acquire timed out
    pub exhausted_count: u64,
}

/// Atomic lifetime counters
#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted_count: AtomicU64,
}

impl AtomicPoolStats {
    fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self, n: u64) {
        self.connections_closed.fetch_add(n, Ordering::Relaxed);
    }

    fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Idle pool entry with metadata
struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner {
    config: PoolConfig,
    connection: ConnectionConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections (LIFO for better cache locality)
    idle: parking_lot::Mutex<Vec<PoolEntry>>,
    semaphore: Arc<Semaphore>,
    total: AtomicUsize,
    waiting: AtomicUsize,
    stats: AtomicPoolStats,
    closed: AtomicBool,
}

impl PoolInner {
    fn forget_connections(&self, n: usize) {
        if n > 0 {
            self.total.fetch_sub(n, Ordering::AcqRel);
            self.stats.record_closed(n as u64);
        }
    }

    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }
}

/// Decrements the waiter count even if the acquiring future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connection borrowed from the pool
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    broken: AtomicBool,
    pool: Arc<PoolInner>,
    // Released after the connection is back in the idle list.
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection already returned")
            .as_ref()
    }
}

impl PooledConnection {
    /// Run a query; a connection error marks this connection broken so it
    /// is discarded instead of returned to the idle list.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let result = (**self).query(sql, params).await;
        if let Err(e) = &result {
            if e.category() == ErrorCategory::Connection {
                self.mark_broken();
            }
        }
        result
    }

    /// Run a query and return the first row
    pub async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Discard this connection when it is dropped
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Whether this connection will be discarded on drop
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
            || self.conn.as_ref().is_some_and(|c| c.is_closed())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let broken = self.is_broken();
        let Some(conn) = self.conn.take() else {
            return;
        };

        if self.pool.closed.load(Ordering::Acquire) {
            self.pool.forget_connections(1);
            return;
        }

        if broken {
            debug!(endpoint = %self.pool.connection.endpoint(), "discarding broken connection");
            self.pool.forget_connections(1);
            return;
        }

        self.pool.idle.lock().push(PoolEntry {
            conn,
            created_at: self.created_at,
            last_used: Instant::now(),
        });
    }
}

/// Connection pool owned by one node.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.connection.endpoint())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a new, empty connection pool.
    pub fn new(
        config: PoolConfig,
        connection: ConnectionConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                idle: parking_lot::Mutex::new(Vec::with_capacity(config.max_size)),
                config,
                connection,
                factory,
                total: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                stats: AtomicPoolStats::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get connection configuration
    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.inner.connection
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Borrow a connection, opening a new one if no idle connection is usable.
    pub async fn get(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let permit = {
            let _waiting = WaitingGuard::new(&inner.waiting);
            tokio::time::timeout(
                inner.config.acquire_timeout,
                inner.semaphore.clone().acquire_owned(),
            )
            .await
        };
        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                inner.stats.record_exhausted();
                return Err(Error::pool_exhausted(format!(
                    "timeout waiting for connection to {} ({}ms)",
                    inner.connection.endpoint(),
                    inner.config.acquire_timeout.as_millis()
                )));
            }
        };

        // Reuse the most recently returned connection that is still usable
        loop {
            let entry = inner.idle.lock().pop();
            let Some(entry) = entry else {
                break;
            };
            if inner.should_recycle(&entry) || entry.conn.is_closed() {
                inner.forget_connections(1);
                continue;
            }
            if inner.config.test_on_borrow && !entry.conn.is_valid().await {
                inner.forget_connections(1);
                continue;
            }
            inner.stats.record_acquisition();
            return Ok(PooledConnection {
                conn: Some(entry.conn),
                created_at: entry.created_at,
                broken: AtomicBool::new(false),
                pool: inner.clone(),
                _permit: permit,
            });
        }

        let conn = self.create_connection().await?;
        inner.stats.record_acquisition();
        Ok(PooledConnection {
            conn: Some(conn),
            created_at: Instant::now(),
            broken: AtomicBool::new(false),
            pool: inner.clone(),
            _permit: permit,
        })
    }

    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let inner = &self.inner;
        let conn = tokio::time::timeout(
            inner.connection.connect_timeout,
            inner.factory.connect(&inner.connection),
        )
        .await
        .map_err(|_| {
            Error::timeout(format!(
                "connect to {} exceeded {}ms",
                inner.connection.endpoint(),
                inner.connection.connect_timeout.as_millis()
            ))
        })??;

        inner.total.fetch_add(1, Ordering::AcqRel);
        inner.stats.record_created();
        Ok(conn)
    }

    /// Close idle connections past their idle timeout or lifetime, keeping
    /// at least `min_size` open. Returns the number closed.
    pub async fn reap_idle(&self) -> usize {
        let inner = &self.inner;
        let expired: Vec<PoolEntry> = {
            let mut idle = inner.idle.lock();
            let mut keep = Vec::with_capacity(idle.len());
            let mut expired = Vec::new();
            let total = inner.total.load(Ordering::Acquire);
            for entry in idle.drain(..) {
                let open_after = total.saturating_sub(expired.len());
                if inner.should_recycle(&entry) && open_after > inner.config.min_size {
                    expired.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            *idle = keep;
            expired
        };

        let n = expired.len();
        for entry in expired {
            if let Err(e) = entry.conn.close().await {
                debug!(endpoint = %inner.connection.endpoint(), error = %e, "error closing idle connection");
            }
        }
        inner.forget_connections(n);
        n
    }

    /// Snapshot pool statistics
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            total: inner.total.load(Ordering::Acquire),
            idle: inner.idle.lock().len(),
            waiting: inner.waiting.load(Ordering::Acquire),
            connections_created: inner.stats.connections_created.load(Ordering::Relaxed),
            connections_closed: inner.stats.connections_closed.load(Ordering::Relaxed),
            acquisitions: inner.stats.acquisitions.load(Ordering::Relaxed),
            exhausted_count: inner.stats.exhausted_count.load(Ordering::Relaxed),
        }
    }

    /// Close all idle connections and refuse further borrows.
    ///
    /// Borrowed connections are dropped as they come back.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.semaphore.close();

        let drained: Vec<PoolEntry> = inner.idle.lock().drain(..).collect();
        let n = drained.len();
        let mut first_error = None;
        for entry in drained {
            if let Err(e) = entry.conn.close().await {
                first_error.get_or_insert(e);
            }
        }
        inner.forget_connections(n);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
