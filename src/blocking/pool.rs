//! Blocking connection pool.
//!
//! Membership lives behind one mutex; threads waiting for a free slot
//! park on a condition variable until a connection comes back, a slot
//! frees up or `acquire_timeout` elapses.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::PgConnection;
use crate::config::{PgConfig, PgPoolConfig};
use crate::connection::QueryResult;
use crate::error::{PgError, PgResult};
use crate::pool::PoolStatus;
use crate::types::PgValue;

struct IdleConnection {
    conn: PgConnection,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<IdleConnection>,
    in_use: HashSet<Uuid>,
    /// Connections that exist or are being opened.
    total: u32,
    closed: bool,
}

struct PoolInner {
    config: PgConfig,
    pool_config: PgPoolConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolInner {
    fn create(&self) -> PgResult<PgConnection> {
        let conn = PgConnection::connect(self.config.clone())?;
        debug!(conn = %conn.id(), address = %self.config.address(), "pool created connection");
        Ok(conn)
    }

    /// Give a slot back after a connection was disposed or never opened.
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.released.notify_one();
    }

    fn push_available(&self, conn: PgConnection) {
        let mut state = self.state.lock();
        state.in_use.remove(&conn.id());
        if state.closed {
            state.total = state.total.saturating_sub(1);
            drop(state);
            close_quietly(conn);
            return;
        }
        state.available.push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
        drop(state);
        self.released.notify_one();
    }

    fn put_back(self: &Arc<Self>, conn: PgConnection) {
        if conn.is_reusable() {
            self.push_available(conn);
        } else {
            self.dispose(conn, "returned unusable");
        }
    }

    fn give_back(self: &Arc<Self>, mut conn: PgConnection) {
        if conn.validate() {
            self.push_available(conn);
        } else {
            self.dispose(conn, "failed validation on return");
        }
    }

    /// Close a connection and free its slot. Below `min_connections` a
    /// replacement is opened on a background thread.
    fn dispose(self: &Arc<Self>, conn: PgConnection, reason: &'static str) {
        debug!(conn = %conn.id(), reason, "disposing pooled connection");
        self.state.lock().in_use.remove(&conn.id());
        close_quietly(conn);
        self.release_slot();

        let needs_replacement = {
            let state = self.state.lock();
            !state.closed && state.total < self.pool_config.min_connections
        };
        if needs_replacement {
            let pool = Arc::clone(self);
            thread::spawn(move || pool.replace());
        }
    }

    /// Failures are only logged; a later `acquire` opens connections on demand.
    fn replace(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.total >= self.pool_config.min_connections {
                return;
            }
            state.total += 1;
        }
        match self.create() {
            Ok(conn) => {
                info!(conn = %conn.id(), "pool replaced connection");
                self.push_available(conn);
            }
            Err(e) => {
                warn!(error = %e, "pool could not replace connection");
                self.release_slot();
            }
        }
    }
}

fn close_quietly(mut conn: PgConnection) {
    if let Err(e) = conn.close() {
        debug!(conn = %conn.id(), error = %e, "error while closing connection");
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from a blocking pool.
///
/// Dropping it returns the connection after cheap checks only; call
/// [`PooledConnection::give_back`] to validate it first.
pub struct PooledConnection {
    conn: Option<PgConnection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub fn give_back(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}

impl Deref for PooledConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pooled connection already returned"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
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
// Connection Pool
// ============================================================================

/// A blocking PostgreSQL connection pool. Cloning shares the pool.
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
                config,
                pool_config,
                state: Mutex::new(PoolState::default()),
                released: Condvar::new(),
            }),
        })
    }

    /// Create a pool and open its `min_connections`.
    pub fn connect(config: PgConfig, pool_config: PgPoolConfig) -> PgResult<Self> {
        let pool = Self::new(config, pool_config)?;
        if !pool.initialize() {
            pool.close();
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

    /// Open and validate connections until `min_connections` exist.
    ///
    /// Returns `false` if any connection could not be created or validated.
    pub fn initialize(&self) -> bool {
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return false;
                }
                if state.total >= self.inner.pool_config.min_connections {
                    break;
                }
                state.total += 1;
            }

            let mut conn = match self.inner.create() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, address = %self.inner.config.address(), "pool initialization failed");
                    self.inner.release_slot();
                    return false;
                }
            };
            if !conn.validate() {
                warn!(conn = %conn.id(), "new connection failed validation");
                close_quietly(conn);
                self.inner.release_slot();
                return false;
            }
            self.inner.push_available(conn);
        }
        info!(
            address = %self.inner.config.address(),
            connections = self.inner.pool_config.min_connections,
            "pool initialized"
        );
        true
    }

    /// Check out a connection, waiting at most `acquire_timeout`.
    pub fn acquire(&self) -> PgResult<PooledConnection> {
        let deadline = self
            .inner
            .pool_config
            .acquire_timeout
            .map(|timeout| (timeout, Instant::now() + timeout));
        let mut state = self.inner.state.lock();

        loop {
            if state.closed {
                return Err(PgError::PoolClosed);
            }

            if let Some(idle) = state.available.pop_back() {
                let expired = idle.since.elapsed() > self.inner.pool_config.idle_time
                    && state.total > self.inner.pool_config.min_connections;
                let id = idle.conn.id();
                state.in_use.insert(id);
                drop(state);

                let mut conn = idle.conn;
                if !expired && conn.validate() {
                    return Ok(self.checked_out(conn));
                }
                self.inner.dispose(
                    conn,
                    if expired { "idle too long" } else { "failed validation on acquire" },
                );
                state = self.inner.state.lock();
                continue;
            }

            if state.total < self.inner.pool_config.max_connections {
                state.total += 1;
                drop(state);
                return match self.inner.create() {
                    Ok(conn) => {
                        self.inner.state.lock().in_use.insert(conn.id());
                        Ok(self.checked_out(conn))
                    }
                    Err(e) => {
                        self.inner.release_slot();
                        Err(e)
                    }
                };
            }

            match deadline {
                Some((timeout, deadline)) => {
                    if self.inner.released.wait_until(&mut state, deadline).timed_out()
                        && state.available.is_empty()
                        && state.total >= self.inner.pool_config.max_connections
                    {
                        return Err(PgError::AcquireTimeout(timeout));
                    }
                }
                None => self.inner.released.wait(&mut state),
            }
        }
    }

    fn checked_out(&self, conn: PgConnection) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a connection after validating it.
    pub fn give_back(&self, conn: PooledConnection) {
        conn.give_back();
    }

    pub fn simple_query(&self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.acquire()?.simple_query(sql)
    }

    pub fn query(&self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.acquire()?.query(sql, params)
    }

    /// Close idle connections and refuse further acquires.
    ///
    /// Connections still checked out belong to their `PooledConnection`;
    /// each one is terminated when it is dropped or given back.
    pub fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.available);
            state.total = state.total.saturating_sub(idle.len() as u32);
            idle
        };
        self.inner.released.notify_all();

        let count = idle.len();
        for IdleConnection { conn, .. } in idle {
            close_quietly(conn);
        }
        info!(address = %self.inner.config.address(), closed = count, "pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
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
            .finish()
    }
}
