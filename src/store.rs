use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Result of a TTL query, mirroring the two distinct sentinels the backing
/// store reports: a key can be missing, present without expiry, or present
/// with a remaining lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    NoExpiry,
    Remaining(Duration),
}

/// Atomic primitives the backing store must supply.
///
/// `set_if_absent` and `compare_and_delete` are the two conditional
/// operations the lock protocol is built on; everything else is plain
/// key/value access. An expired key behaves as absent for every operation.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All currently stored keys beginning with `prefix`. No snapshot
    /// isolation: concurrent writers may or may not be observed.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;
    /// Create the key only if it is currently absent. Returns whether the
    /// write happened.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<bool>;
    /// Delete the key only if its current value equals `expected`.
    /// Returns whether the delete happened.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;
    /// Set or refresh the TTL of an existing key. Returns false when the
    /// key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    deadline: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            deadline: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn live(&self) -> bool {
        self.deadline.map_or(true, |deadline| Instant::now() < deadline)
    }
}

/// In-memory `Store` with lazy TTL expiry. Stands in for the real backing
/// store in tests; expired entries are dropped the next time they are seen.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.data.get(key) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.data.remove_if(key, |_, entry| !entry.live());
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.data.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().live())
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        match self.data.get(key) {
            Some(entry) if entry.live() => match entry.deadline {
                None => Ok(KeyTtl::NoExpiry),
                Some(deadline) => Ok(KeyTtl::Remaining(
                    deadline.saturating_duration_since(Instant::now()),
                )),
            },
            _ => Ok(KeyTtl::Missing),
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        // The dashmap entry API holds the shard lock, making the
        // check-then-insert atomic.
        match self.data.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    Ok(false)
                } else {
                    occupied.insert(Entry::new(value, ttl));
                    Ok(true)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let removed = self
            .data
            .remove_if(key, |_, entry| entry.live() && entry.value == expected);
        Ok(removed.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        match self.data.get_mut(key) {
            Some(mut entry) if entry.live() => {
                entry.deadline = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
