//! Hierarchical intention locking over the store's atomic primitives.
//!
//! An exclusive lock on `a.b.c` is a chain: intention records on the root,
//! `a` and `a.b`, then the exclusive record on `a.b.c` itself. Intention
//! records are compatible with each other, so sibling subtrees never
//! contend; an exclusive record conflicts with everything on its own path.
//! Every record carries a lease, so a crashed holder blocks others for at
//! most one lease period.
//!
//! Record layout in the store:
//! - exclusive on `p`: one record at `l:.<p>`;
//! - intention on `p` by holder `t`: one record at `l:.<p>#<t>`.
//!
//! Both sides register their own record before checking for the other
//! side's, so of two racing acquirers at least one observes the conflict
//! and backs off; randomized backoff breaks the symmetry.

use crate::error::{Error, Result};
use crate::path::{Path, TOKEN_MARK};
use crate::store::Store;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default bound on how long `acquire` keeps retrying.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default lease on every lock record.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

const BACKOFF_BASE_MS: u64 = 10;
const BACKOFF_CAP_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Exclusive,
    Intention,
}

/// What a lock key holds in the store. A record whose lease has elapsed is
/// absent for every protocol purpose and may be reclaimed by any acquirer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LockRecord {
    token: Uuid,
    mode: LockMode,
    expires_at: DateTime<Utc>,
}

impl LockRecord {
    fn new(token: Uuid, mode: LockMode, lease: Duration) -> Self {
        Self {
            token,
            mode,
            expires_at: Utc::now()
                + chrono::Duration::milliseconds(lease.as_millis() as i64),
        }
    }

    fn is_live(&self) -> bool {
        Utc::now() < self.expires_at
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// One record we own, with the exact bytes sitting in the store. Release
/// and renewal are value-guarded, so the bytes must be tracked verbatim.
#[derive(Debug, Clone)]
struct HeldRecord {
    key: String,
    bytes: Vec<u8>,
}

/// Proof of a fully acquired lock chain. Release is idempotent; dropping
/// an unreleased handle leaves the records to their lease.
#[derive(Debug)]
pub struct LockHandle {
    path: Path,
    mode: LockMode,
    token: Uuid,
    lease: Duration,
    /// Root-first; released in reverse.
    chain: Vec<HeldRecord>,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Lease currently applied to every record in the chain.
    pub fn lease(&self) -> Duration {
        self.lease
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            warn!(path = %self.path, token = %self.token,
                "lock handle dropped without release, lease will expire on its own");
        }
    }
}

fn intention_key(path: &Path, token: Uuid) -> String {
    format!("{}{}{}", path.lock_key(), TOKEN_MARK, token.simple())
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = (BACKOFF_BASE_MS << attempt.min(8)).min(BACKOFF_CAP_MS);
    let jittered = rand::thread_rng().gen_range(base / 2..=base + base / 2);
    Duration::from_millis(jittered)
}

/// Outcome of a single per-path attempt.
enum Attempt {
    Held(HeldRecord),
    Contended,
}

/// Sole writer of lock records. One instance per store handle.
#[derive(Debug, Clone)]
pub struct LockManager {
    store: Arc<dyn Store>,
}

impl LockManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Acquire `mode` on `path`, taking intention records on every strict
    /// ancestor first (root to leaf). Retries with jittered exponential
    /// backoff until `timeout` elapses; a zero timeout means exactly one
    /// attempt. On failure the partial chain is fully unwound before
    /// `LockTimeout` is returned.
    pub async fn acquire(
        &self,
        path: &Path,
        mode: LockMode,
        timeout: Duration,
        lease: Duration,
    ) -> Result<LockHandle> {
        let token = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut chain: Vec<HeldRecord> = Vec::with_capacity(path.depth() + 1);

        let mut steps: Vec<(Path, LockMode)> = path
            .ancestors()
            .map(|ancestor| (ancestor, LockMode::Intention))
            .collect();
        steps.push((path.clone(), mode));

        for (step_path, step_mode) in steps {
            match self
                .acquire_step(&step_path, step_mode, token, lease, deadline)
                .await
            {
                Ok(held) => chain.push(held),
                Err(err) => {
                    self.unwind(&mut chain).await;
                    return match err {
                        Error::LockTimeout { .. } => Err(Error::LockTimeout {
                            path: path.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        }),
                        other => Err(other),
                    };
                }
            }
        }

        debug!(path = %path, ?mode, %token, "lock chain acquired");
        Ok(LockHandle {
            path: path.clone(),
            mode,
            token,
            lease,
            chain,
            released: false,
        })
    }

    /// Retry loop for a single path in the chain.
    async fn acquire_step(
        &self,
        path: &Path,
        mode: LockMode,
        token: Uuid,
        lease: Duration,
        deadline: Instant,
    ) -> Result<HeldRecord> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match mode {
                LockMode::Intention => self.try_intention(path, token, lease).await?,
                LockMode::Exclusive => self.try_exclusive(path, token, lease).await?,
            };
            match outcome {
                Attempt::Held(held) => return Ok(held),
                Attempt::Contended => {
                    trace!(path = %path, ?mode, attempt, "lock contended, backing off");
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::LockTimeout {
                            path: path.to_string(),
                            waited_ms: 0,
                        });
                    }
                    let delay = backoff_delay(attempt).min(deadline - now);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Register an intention record for this holder, then verify no live
    /// exclusive record sits on the same path. Backs out on conflict.
    async fn try_intention(
        &self,
        path: &Path,
        token: Uuid,
        lease: Duration,
    ) -> Result<Attempt> {
        let key = intention_key(path, token);
        let bytes = LockRecord::new(token, LockMode::Intention, lease).to_bytes()?;
        // The key embeds our token, so it can only collide with a leftover
        // of our own earlier lease; either way the write is ours.
        if !self
            .store
            .set_if_absent(&key, bytes.clone(), Some(lease))
            .await?
        {
            self.store.set(&key, bytes.clone(), Some(lease)).await?;
        }

        if let Some(raw) = self.store.get(&path.lock_key()).await? {
            if record_is_live(&raw) {
                self.store.compare_and_delete(&key, &bytes).await?;
                return Ok(Attempt::Contended);
            }
            // Stale exclusive record: reclaim it so nobody trips on it.
            self.store
                .compare_and_delete(&path.lock_key(), &raw)
                .await?;
        }

        Ok(Attempt::Held(HeldRecord { key, bytes }))
    }

    /// Claim the exclusive record, then verify no live intention record of
    /// another holder exists on the same path. Backs out on conflict.
    async fn try_exclusive(
        &self,
        path: &Path,
        token: Uuid,
        lease: Duration,
    ) -> Result<Attempt> {
        let key = path.lock_key();
        let bytes = LockRecord::new(token, LockMode::Exclusive, lease).to_bytes()?;

        loop {
            if self
                .store
                .set_if_absent(&key, bytes.clone(), Some(lease))
                .await?
            {
                break;
            }
            match self.store.get(&key).await? {
                // Deleted between our attempts; try again right away.
                None => continue,
                Some(raw) => {
                    if record_is_live(&raw) {
                        return Ok(Attempt::Contended);
                    }
                    // Stale or unparseable record: reclaim and retry.
                    self.store.compare_and_delete(&key, &raw).await?;
                }
            }
        }

        // Our record is in place; anyone acquiring below us from now on
        // will see it. Check for intention holders that beat us here.
        let marker_prefix = format!("{}{}", key, TOKEN_MARK);
        for marker_key in self.store.scan(&marker_prefix).await? {
            match self.store.get(&marker_key).await? {
                Some(raw) if record_is_live(&raw) => {
                    self.store.compare_and_delete(&key, &bytes).await?;
                    return Ok(Attempt::Contended);
                }
                Some(raw) => {
                    // Expired marker; collect it.
                    self.store.compare_and_delete(&marker_key, &raw).await?;
                }
                None => {}
            }
        }

        Ok(Attempt::Held(HeldRecord { key, bytes }))
    }

    /// Release every record in the chain, leaf to root. Idempotent: a
    /// record that expired, was reclaimed, or was already released is
    /// skipped silently.
    pub async fn release(&self, handle: &mut LockHandle) -> Result<()> {
        if handle.released {
            return Ok(());
        }
        let mut chain = std::mem::take(&mut handle.chain);
        self.unwind(&mut chain).await;
        handle.released = true;
        debug!(path = %handle.path, token = %handle.token, "lock chain released");
        Ok(())
    }

    async fn unwind(&self, chain: &mut Vec<HeldRecord>) {
        while let Some(held) = chain.pop() {
            // Value-guarded: if the lease expired and someone else took
            // over, their record has different bytes and survives.
            if let Err(err) = self
                .store
                .compare_and_delete(&held.key, &held.bytes)
                .await
            {
                warn!(key = %held.key, %err, "failed to release lock record");
            }
        }
    }

    /// Extend the lease on every record in the chain, root to leaf.
    /// Fails with `LockLost` if any record was reclaimed in the meantime.
    pub async fn renew(&self, handle: &mut LockHandle, lease: Duration) -> Result<()> {
        if handle.released {
            return Err(Error::LockLost {
                path: handle.path.to_string(),
            });
        }
        for held in &mut handle.chain {
            let current = self.store.get(&held.key).await?;
            if current.as_deref() != Some(held.bytes.as_slice()) {
                return Err(Error::LockLost {
                    path: handle.path.to_string(),
                });
            }
            let mode = if held.key.contains(TOKEN_MARK) {
                LockMode::Intention
            } else {
                LockMode::Exclusive
            };
            let fresh = LockRecord::new(handle.token, mode, lease).to_bytes()?;
            self.store.set(&held.key, fresh.clone(), Some(lease)).await?;
            held.bytes = fresh;
        }
        handle.lease = lease;
        trace!(path = %handle.path, token = %handle.token, "lease renewed");
        Ok(())
    }

    /// Observational probe: is `path` covered by anyone's lock right now?
    /// True when a live exclusive record exists on the path or an ancestor,
    /// or any live record (intention or exclusive) exists at or below it.
    pub async fn is_locked(&self, path: &Path) -> Result<bool> {
        for ancestor in path.ancestors() {
            if self.live_exclusive(&ancestor).await? {
                return Ok(true);
            }
        }
        if self.live_exclusive(path).await? {
            return Ok(true);
        }
        // Own intention markers plus everything in the subtree below.
        let own_markers = format!("{}{}", path.lock_key(), TOKEN_MARK);
        let subtree = format!("{}{}", path.lock_key(), crate::path::SEPARATOR);
        for prefix in [own_markers, subtree] {
            for key in self.store.scan(&prefix).await? {
                if let Some(raw) = self.store.get(&key).await? {
                    if record_is_live(&raw) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn live_exclusive(&self, path: &Path) -> Result<bool> {
        match self.store.get(&path.lock_key()).await? {
            Some(raw) => Ok(record_is_live(&raw)),
            None => Ok(false),
        }
    }
}

/// An unparseable record is treated as dead so it can be reclaimed instead
/// of wedging the path forever.
fn record_is_live(raw: &[u8]) -> bool {
    serde_json::from_slice::<LockRecord>(raw)
        .map(|record| record.is_live())
        .unwrap_or(false)
}
