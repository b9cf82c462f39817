//! One pool per set of connection options.
//!
//! `PoolRegistry` is an ordinary value owned by the application; there is
//! no process-wide registry.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::PgConfig;
use crate::error::PgResult;

/// Maps connection options to the pool serving them.
///
/// `P` is any cheaply clonable pool handle, such as [`crate::PgPool`] or
/// [`crate::blocking::PgPool`].
pub struct PoolRegistry<P> {
    pools: Mutex<HashMap<PgConfig, P>>,
}

impl<P: Clone> PoolRegistry<P> {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The pool for `config`, creating it with `create` if there is none.
    ///
    /// The registry lock is held while `create` runs, so two callers never
    /// build a pool for the same options.
    pub fn get_or_insert_with<F>(&self, config: &PgConfig, create: F) -> PgResult<P>
    where
        F: FnOnce(&PgConfig) -> PgResult<P>,
    {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(config) {
            return Ok(pool.clone());
        }
        let pool = create(config)?;
        tracing::debug!(address = %config.address(), database = %config.database, "registered pool");
        pools.insert(config.clone(), pool.clone());
        Ok(pool)
    }

    pub fn get(&self, config: &PgConfig) -> Option<P> {
        self.pools.lock().get(config).cloned()
    }

    /// Forget the pool for `config` and hand it back for closing.
    pub fn remove(&self, config: &PgConfig) -> Option<P> {
        self.pools.lock().remove(config)
    }

    /// Empty the registry, returning every pool.
    pub fn take_all(&self) -> Vec<P> {
        self.pools.lock().drain().map(|(_, pool)| pool).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }
}

impl<P: Clone> Default for PoolRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
