//! The per-path handle: read, write and lock one node of the hierarchy.
//!
//! A `Section` is cheap to create and carries no server-side state; it
//! captures its store handle at construction, so reconfiguring the default
//! pool never affects it. Plain reads and writes are unprotected (last
//! write wins per leaf); callers that need cross-process correctness wrap
//! their work in [`Section::with_lock`] or hold a [`LockedSection`].

use crate::config::Pool;
use crate::error::{Error, Result};
use crate::lock::{LockHandle, LockManager, LockMode, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_LEASE};
use crate::path::{Path, SEPARATOR};
use crate::store::{KeyTtl, Store};
use crate::value;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Section {
    path: Path,
    store: Arc<dyn Store>,
    locks: LockManager,
    acquire_timeout: Duration,
    lease: Duration,
}

impl Section {
    /// Handle for the root of the hierarchy in the given logical database.
    pub fn root(pool: &Pool, db_name: Option<&str>) -> Self {
        Self::with_store(pool.store(db_name), Path::root())
    }

    /// Handle for a dotted path in the given logical database.
    pub fn open(pool: &Pool, db_name: Option<&str>, path: &str) -> Result<Self> {
        Ok(Self::with_store(pool.store(db_name), Path::parse(path)?))
    }

    /// Handle backed by an explicit store. The seam the pool plugs into;
    /// also handy for tests.
    pub fn with_store(store: Arc<dyn Store>, path: Path) -> Self {
        Self {
            path,
            locks: LockManager::new(store.clone()),
            store,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            lease: DEFAULT_LEASE,
        }
    }

    /// Override the lock acquisition timeout and lease used by the scoped
    /// locking methods.
    pub fn with_lock_params(mut self, acquire_timeout: Duration, lease: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self.lease = lease;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Child handle for a dotted relative path. Pure path composition:
    /// never touches the store, and a child that was never written is a
    /// perfectly good handle that reads as absent.
    pub fn get(&self, key: &str) -> Result<Section> {
        if key.is_empty() {
            return Err(Error::InvalidPath {
                path: key.to_string(),
                reason: "empty segment",
            });
        }
        let mut child = self.clone();
        child.path = self.path.join(key)?;
        Ok(child)
    }

    /// Keys of every descendant leaf currently stored below this node.
    async fn descendant_keys(&self) -> Result<Vec<String>> {
        let prefix = format!("{}{}", self.path.value_key(), SEPARATOR);
        self.store.scan(&prefix).await
    }

    /// True iff this node or any descendant currently has a stored value.
    pub async fn exists(&self) -> Result<bool> {
        if self.store.get(&self.path.value_key()).await?.is_some() {
            return Ok(true);
        }
        Ok(!self.descendant_keys().await?.is_empty())
    }

    /// The node's value: its own leaf if one is stored, otherwise the
    /// recursive merge of all descendant leaves, otherwise `None`.
    pub async fn value(&self) -> Result<Option<Value>> {
        if let Some(raw) = self.store.get(&self.path.value_key()).await? {
            return Ok(Some(serde_json::from_slice(&raw)?));
        }

        let mut tree = Map::new();
        let mut found = false;
        let own_depth = self.path.depth();
        for key in self.descendant_keys().await? {
            let raw = match self.store.get(&key).await? {
                Some(raw) => raw,
                // Expired or deleted between scan and get.
                None => continue,
            };
            let leaf_path = Path::from_value_key(&key).ok_or_else(|| {
                Error::Internal(format!("unexpected key in value tree: {key}"))
            })?;
            let relative = leaf_path.segments()[own_depth..].to_vec();
            value::merge_into(&mut tree, &relative, serde_json::from_slice(&raw)?);
            found = true;
        }

        if found {
            Ok(Some(Value::Object(tree)))
        } else {
            Ok(None)
        }
    }

    /// Write `value` at the child path. An object is expanded into one
    /// independently atomic leaf write per field; anything else is a
    /// single leaf. Scalar values stored on ancestor paths are removed so
    /// the written leaves are reachable by merge. Returns the child
    /// handle for chaining.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        expire: Option<Duration>,
    ) -> Result<Section> {
        let target = self.get(key)?;

        // A leaf sitting on an ancestor path would shadow the new value.
        for ancestor in target.path.ancestors() {
            self.store.delete(&ancestor.value_key()).await?;
        }

        let leaves = if value.is_object() {
            // Overwriting a subtree: drop whatever was there before.
            target.clear().await?;
            value::flatten(&target.path, &value)?
        } else {
            vec![(target.path.clone(), value)]
        };

        for (leaf_path, leaf) in leaves {
            self.store
                .set(&leaf_path.value_key(), serde_json::to_vec(&leaf)?, expire)
                .await?;
        }

        Ok(target)
    }

    /// Remove the value at the child path; for an internal node this
    /// removes the whole subtree. Deleting an absent child is a no-op.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.get(key)?.clear().await
    }

    /// Remove this node's value and every descendant's. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        for key in self.descendant_keys().await? {
            self.store.delete(&key).await?;
        }
        self.store.delete(&self.path.value_key()).await
    }

    /// Handles for the immediate children currently present, derived from
    /// one scan. Lazy over that key set only: not restartable and not a
    /// snapshot; writes racing with the scan may or may not be observed.
    pub async fn children(&self) -> Result<Children> {
        let own_depth = self.path.depth();
        let mut segments = BTreeSet::new();
        for key in self.descendant_keys().await? {
            if let Some(leaf_path) = Path::from_value_key(&key) {
                if let Some(segment) = leaf_path.segments().get(own_depth) {
                    segments.insert(segment.clone());
                }
            }
        }
        let sections = segments
            .into_iter()
            .map(|segment| {
                let mut child = self.clone();
                child.path = self.path.child(&segment)?;
                Ok(child)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Children {
            inner: sections.into_iter(),
        })
    }

    /// Remaining lifetime of this node: its own leaf's TTL if one is
    /// stored, otherwise the first descendant's. `Missing` and `NoExpiry`
    /// are distinct sentinels, mirroring the store.
    pub async fn time_to_live(&self) -> Result<KeyTtl> {
        let own_key = self.path.value_key();
        if self.store.get(&own_key).await?.is_some() {
            return self.store.ttl(&own_key).await;
        }
        match self.descendant_keys().await?.into_iter().next() {
            Some(key) => self.store.ttl(&key).await,
            None => Ok(KeyTtl::Missing),
        }
    }

    /// Set or refresh the time-to-live on this node's leaf and every
    /// descendant leaf.
    pub async fn expire(&self, ttl: Duration) -> Result<()> {
        self.store.expire(&self.path.value_key(), ttl).await?;
        for key in self.descendant_keys().await? {
            self.store.expire(&key, ttl).await?;
        }
        Ok(())
    }

    /// Numeric read-modify-write convenience: add `delta` to the stored
    /// integer, treating an absent value as zero. Not atomic on its own;
    /// run it under a lock scope when other writers exist.
    pub async fn add(&self, delta: i64) -> Result<i64> {
        let current = match self.value().await? {
            None => 0,
            Some(value) => value.as_i64().ok_or_else(|| Error::NotANumber {
                path: self.path.to_string(),
            })?,
        };
        let updated = current + delta;
        self.store
            .set(
                &self.path.value_key(),
                serde_json::to_vec(&Value::from(updated))?,
                None,
            )
            .await?;
        Ok(updated)
    }

    /// Is this node covered by anyone's lock right now?
    pub async fn is_locked(&self) -> Result<bool> {
        self.locks.is_locked(&self.path).await
    }

    /// Take an exclusive lock on this node's path with the section's
    /// configured timeout and lease.
    pub async fn lock(&self) -> Result<LockedSection> {
        self.lock_with(self.acquire_timeout, self.lease).await
    }

    /// Take an exclusive lock with explicit timeout and lease.
    pub async fn lock_with(&self, timeout: Duration, lease: Duration) -> Result<LockedSection> {
        let handle = self
            .locks
            .acquire(&self.path, LockMode::Exclusive, timeout, lease)
            .await?;
        Ok(LockedSection {
            section: self.clone(),
            handle,
        })
    }

    /// Run `f` under an exclusive lock on this node's path. The lock is
    /// released on every exit path, including when `f` fails.
    pub async fn with_lock<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Section) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut locked = self.lock().await?;
        let outcome = f(self.clone()).await;
        let released = self.locks.release(&mut locked.handle).await;
        let value = outcome?;
        released?;
        Ok(value)
    }
}

/// Iterator over the immediate children observed by one scan. Consuming;
/// create a new one to observe later writes.
#[derive(Debug)]
pub struct Children {
    inner: std::vec::IntoIter<Section>,
}

impl Iterator for Children {
    type Item = Section;

    fn next(&mut self) -> Option<Section> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// A section holding an exclusive lock on its path. Dereferences to the
/// plain section for data access; `release` consumes it. Dropping without
/// releasing leaves the records to their lease (and logs a warning),
/// because an async release cannot run in `Drop`.
#[derive(Debug)]
pub struct LockedSection {
    section: Section,
    handle: LockHandle,
}

impl LockedSection {
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Extend the lease; needed for critical sections that outlive it.
    pub async fn renew(&mut self, lease: Duration) -> Result<()> {
        self.section.locks.renew(&mut self.handle, lease).await
    }

    /// Release the lock chain. Idempotent at the protocol level: releasing
    /// after lease expiry is a silent no-op.
    pub async fn release(mut self) -> Result<()> {
        self.section.locks.release(&mut self.handle).await
    }
}

impl Deref for LockedSection {
    type Target = Section;

    fn deref(&self) -> &Section {
        &self.section
    }
}
