//! Helpers for exercising sections and locks against an in-memory store.

use crate::config::{Config, Pool};
use crate::lock::LockManager;
use crate::path::Path;
use crate::section::Section;
use crate::store::{MemoryStore, Store};
use std::sync::Arc;

/// A fresh in-memory store, shared by handles that should see each other's
/// writes the way separate processes sharing one server would.
pub fn memory_store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

/// A pool whose every logical database is an independent memory store.
pub fn memory_pool() -> Arc<Pool> {
    Arc::new(Pool::in_memory())
}

/// A pool with named logical databases, all in-memory.
pub fn memory_pool_with_names(names: &[(&str, u32)]) -> Arc<Pool> {
    let mut config = Config::default();
    for (name, index) in names {
        config.names.insert((*name).to_string(), *index);
    }
    Arc::new(Pool::new(config, |_, _| Arc::new(MemoryStore::new())))
}

/// Section on a shared store. Panics on a malformed path; tests only.
pub fn section_on(store: &Arc<dyn Store>, path: &str) -> Section {
    Section::with_store(store.clone(), Path::parse(path).expect("valid test path"))
}

/// Lock manager on a shared store.
pub fn lock_manager_on(store: &Arc<dyn Store>) -> LockManager {
    LockManager::new(store.clone())
}

/// Install a tracing subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
