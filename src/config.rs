//! Connection configuration and the per-database store pool.
//!
//! The pool is an explicit, caller-constructed object; sections capture
//! their store handle at construction, so replacing the process-wide
//! default never leaks into handles that already exist.

use crate::store::{MemoryStore, Store};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Connection settings for the backing store. `names` maps logical
/// database names to indices; unnamed lookups fall back to `database`.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database: u32,
    pub names: HashMap<String, u32>,
    pub password: Option<String>,
    pub max_connections: u32,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
            names: HashMap::new(),
            password: None,
            max_connections: 100,
            timeout: Duration::from_secs(50),
        }
    }
}

type StoreFactory = dyn Fn(&Config, u32) -> Arc<dyn Store> + Send + Sync;

/// Lazily builds and caches one `Store` handle per logical database.
///
/// The factory is what actually talks to the network; this crate only
/// ships the in-memory one. A real client implementation plugs in here.
pub struct Pool {
    config: Config,
    factory: Box<StoreFactory>,
    stores: DashMap<u32, Arc<dyn Store>>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("databases", &self.stores.len())
            .finish()
    }
}

impl Pool {
    pub fn new<F>(config: Config, factory: F) -> Self
    where
        F: Fn(&Config, u32) -> Arc<dyn Store> + Send + Sync + 'static,
    {
        Self {
            config,
            factory: Box::new(factory),
            stores: DashMap::new(),
        }
    }

    /// A pool backed entirely by in-process memory stores. Used by tests
    /// and as the fallback default.
    pub fn in_memory() -> Self {
        Self::new(Config::default(), |_, _| Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn database_index(&self, name: Option<&str>) -> u32 {
        name.and_then(|name| self.config.names.get(name).copied())
            .unwrap_or(self.config.database)
    }

    /// Store handle for a logical database, built on first use.
    pub fn store(&self, db_name: Option<&str>) -> Arc<dyn Store> {
        let index = self.database_index(db_name);
        self.stores
            .entry(index)
            .or_insert_with(|| {
                debug!(database = index, "creating store handle");
                (self.factory)(&self.config, index)
            })
            .clone()
    }
}

static DEFAULT_POOL: RwLock<Option<Arc<Pool>>> = RwLock::new(None);

/// The process-wide default pool, created in-memory on first use if
/// nothing was configured.
pub fn default_pool() -> Arc<Pool> {
    if let Some(pool) = DEFAULT_POOL.read().clone() {
        return pool;
    }
    let mut slot = DEFAULT_POOL.write();
    slot.get_or_insert_with(|| {
        debug!("no default pool configured, falling back to in-memory");
        Arc::new(Pool::in_memory())
    })
    .clone()
}

/// Replace the process-wide default pool. Sections constructed earlier
/// keep the store handle they were built with.
pub fn configure(pool: Arc<Pool>) {
    *DEFAULT_POOL.write() = Some(pool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_mapping_falls_back_to_default_database() {
        let mut config = Config::default();
        config.database = 3;
        config.names.insert("cache".to_string(), 7);
        let pool = Pool::new(config, |_, _| Arc::new(MemoryStore::new()));

        assert_eq!(pool.database_index(Some("cache")), 7);
        assert_eq!(pool.database_index(Some("unknown")), 3);
        assert_eq!(pool.database_index(None), 3);
    }

    #[test]
    fn store_handles_are_cached_per_database() {
        let mut config = Config::default();
        config.names.insert("a".to_string(), 1);
        config.names.insert("b".to_string(), 2);
        let pool = Pool::new(config, |_, _| Arc::new(MemoryStore::new()));

        let first = pool.store(Some("a"));
        let again = pool.store(Some("a"));
        let other = pool.store(Some("b"));
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn reconfigure_replaces_the_default() {
        let before = default_pool();
        configure(Arc::new(Pool::in_memory()));
        let after = default_pool();
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
