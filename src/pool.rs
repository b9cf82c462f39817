//! PostgreSQL connection pool.
//!
//! A fair `tokio::sync::Semaphore` bounds the number of checked-out
//! connections; idle connections wait in a mutex-guarded queue. Every
//! connection is validated before it is handed out and when it comes back.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{PgConfig, PgPoolConfig};
use crate::connection::{PgConnection, QueryResult};
use crate::error::{PgError, PgResult};
use crate::transport::TokioStream;
use crate::types::PgValue;

type Connection = PgConnection<TokioStream>;

/// Snapshot of a pool's membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub in_use: usize,
    pub max_connections: u32,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// Dereferences to [`PgConnection`]. When dropped, the connection goes back
/// to the pool after cheap checks only; use [`PooledConnection::give_back`]
/// to have it fully validated first.
pub struct PooledConnection {
    /// The actual connection (None once returned to the pool)
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Return the connection after validating it.
    pub async fn give_back(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn).await;
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `give_back` and `drop` take the connection, both consuming self
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pooled connection already returned"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("pooled connection already returned"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Idle connections, most recently returned at the back
    available: VecDeque<IdleConnection>,
    in_use: HashSet<Uuid>,
}

struct PoolInner {
    config: PgConfig,
    pool_config: PgPoolConfig,
    /// Semaphore to limit checked-out connections
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn total(&self) -> usize {
        let state = self.state.lock();
        state.available.len() + state.in_use.len()
    }

    async fn create(&self) -> PgResult<Connection> {
        let conn = PgConnection::connect(self.config.clone()).await?;
        debug!(conn = %conn.id(), address = %self.config.address(), "pool created connection");
        Ok(conn)
    }

    fn push_available(&self, conn: Connection) {
        let mut state = self.state.lock();
        state.in_use.remove(&conn.id());
        state.available.push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    /// Return after cheap checks, without I/O.
    fn put_back(self: &Arc<Self>, conn: Connection) {
        if conn.is_reusable() && !self.is_closed() {
            self.push_available(conn);
        } else {
            self.dispose(conn, "returned unusable");
        }
    }

    async fn give_back(self: &Arc<Self>, mut conn: Connection) {
        if !self.is_closed() && conn.validate().await && !self.is_closed() {
            self.push_available(conn);
        } else {
            self.dispose(conn, "failed validation on return");
        }
    }

    /// Forget a connection and close it in the background. Below
    /// `min_connections` a replacement is started.
    fn dispose(self: &Arc<Self>, conn: Connection, reason: &'static str) {
        self.state.lock().in_use.remove(&conn.id());
        debug!(conn = %conn.id(), reason, "disposing pooled connection");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let mut conn = conn;
            let _ = conn.close().await;
        });

        if !self.is_closed() && self.total() < self.pool_config.min_connections as usize {
            let pool = Arc::clone(self);
            handle.spawn(async move { pool.replace().await });
        }
    }

    /// Create one connection towards `min_connections`. Failures are only
    /// logged; a later `acquire` creates connections on demand anyway.
    async fn replace(self: Arc<Self>) {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            return;
        };
        match self.create().await {
            Ok(conn) if !self.is_closed() => {
                info!(conn = %conn.id(), "pool replaced connection");
                self.push_available(conn);
            }
            Ok(mut conn) => {
                let _ = conn.close().await;
            }
            Err(e) => warn!(error = %e, "pool could not replace connection"),
        }
        drop(permit);
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// An async PostgreSQL connection pool.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

impl PgPool {
    /// Create a pool without opening any connection.
    pub fn new(config: PgConfig, pool_config: PgPoolConfig) -> PgResult<Self> {
        config.validate()?;
        pool_config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(pool_config.max_connections as usize)),
                state: Mutex::new(PoolState::default()),
                closed: AtomicBool::new(false),
                config,
                pool_config,
            }),
        })
    }

    /// Create a pool and open its `min_connections`.
    pub async fn connect(config: PgConfig, pool_config: PgPoolConfig) -> PgResult<Self> {
        let pool = Self::new(config, pool_config)?;
        if !pool.initialize().await {
            pool.close().await;
            return Err(PgError::CouldNotInitializeConnection {
                message: format!(
                    "could not open {} connections to {}",
                    pool.inner.pool_config.min_connections,
                    pool.inner.config.address()
                ),
                source: None,
            });
        }
        Ok(pool)
    }

    /// Open and validate connections until `min_connections` are idle.
    ///
    /// Returns `false` if any connection could not be created or validated.
    pub async fn initialize(&self) -> bool {
        let min = self.inner.pool_config.min_connections as usize;
        while self.inner.total() < min {
            if self.inner.is_closed() {
                return false;
            }
            let Ok(permit) = Arc::clone(&self.inner.semaphore).acquire_owned().await else {
                return false;
            };
            let created = self.inner.create().await;
            let mut conn = match created {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, address = %self.inner.config.address(), "pool initialization failed");
                    return false;
                }
            };
            if !conn.validate().await {
                warn!(conn = %conn.id(), "new connection failed validation");
                let _ = conn.close().await;
                return false;
            }
            self.inner.push_available(conn);
            drop(permit);
        }
        info!(address = %self.inner.config.address(), connections = min, "pool initialized");
        true
    }

    /// Check out a connection.
    ///
    /// Waits at most `acquire_timeout` for a free slot; an idle connection
    /// is validated before it is returned, otherwise a new one is opened.
    pub async fn acquire(&self) -> PgResult<PooledConnection> {
        if self.inner.is_closed() {
            return Err(PgError::PoolClosed);
        }

        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = match self.inner.pool_config.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, semaphore.acquire_owned())
                .await
                .map_err(|_| PgError::AcquireTimeout(timeout))?,
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| PgError::PoolClosed)?;

        let conn = loop {
            if self.inner.is_closed() {
                return Err(PgError::PoolClosed);
            }
            let idle = self.inner.state.lock().available.pop_back();
            match idle {
                Some(idle) if self.is_expired(&idle) => {
                    self.inner.dispose(idle.conn, "idle too long");
                }
                Some(mut idle) => {
                    if idle.conn.validate().await {
                        break idle.conn;
                    }
                    self.inner.dispose(idle.conn, "failed validation on acquire");
                }
                None => break self.inner.create().await?,
            }
        };

        self.inner.state.lock().in_use.insert(conn.id());
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Idle past `idle_time` and not needed to keep `min_connections`.
    fn is_expired(&self, idle: &IdleConnection) -> bool {
        idle.since.elapsed() > self.inner.pool_config.idle_time
            && self.inner.total() >= self.inner.pool_config.min_connections as usize
    }

    /// Return a connection after validating it.
    pub async fn give_back(&self, conn: PooledConnection) {
        conn.give_back().await;
    }

    /// Execute a simple query on a pooled connection.
    pub async fn simple_query(&self, sql: &str) -> PgResult<Vec<QueryResult>> {
        let mut conn = self.acquire().await?;
        conn.simple_query(sql).await
    }

    /// Execute a parameterized query on a pooled connection.
    pub async fn query(&self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let mut conn = self.acquire().await?;
        conn.query(sql, params).await
    }

    /// Close idle connections and refuse further acquires.
    ///
    /// Connections checked out at this point are owned by their
    /// `PooledConnection`, so the pool cannot reach them. They are
    /// terminated as soon as they are dropped or given back.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();

        let idle = std::mem::take(&mut self.inner.state.lock().available);
        let count = idle.len();
        for IdleConnection { mut conn, .. } in idle {
            let _ = conn.close().await;
        }
        info!(address = %self.inner.config.address(), closed = count, "pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: state.available.len(),
            in_use: state.in_use.len(),
            max_connections: self.inner.pool_config.max_connections,
        }
    }

    pub fn config(&self) -> &PgConfig {
        &self.inner.config
    }

    pub fn pool_config(&self) -> &PgPoolConfig {
        &self.inner.pool_config
    }
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool")
            .field("address", &self.inner.config.address())
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}
