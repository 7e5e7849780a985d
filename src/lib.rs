#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Path-addressed hierarchical key/value sections over a shared store.
//!
//! Values live in an arbitrarily nested tree addressed by dotted paths
//! (`a.b.c`). Writing an object at a path stores one leaf per field at the
//! expanded child paths; reading an internal node merges the descendant
//! leaves back together, so the two representations are interchangeable.
//!
//! Cross-process safety comes from a hierarchical intention-lock protocol:
//! an exclusive lock on a path first places intention records on every
//! ancestor, so whole-subtree readers and writers anywhere on the chain
//! see each other, while sibling subtrees (`a.b` vs `a.c`) never contend.
//! Every lock record carries a lease, so a crashed holder blocks others
//! for at most one lease period.
//!
//! ```no_run
//! use serde_json::json;
//! use trellis::{section, Result};
//!
//! # async fn demo() -> Result<()> {
//! let cfg = section("config")?;
//! cfg.set("ui", json!({"theme": "dark", "zoom": 1.25}), None).await?;
//! assert_eq!(cfg.get("ui.theme")?.value().await?, Some(json!("dark")));
//!
//! // Cross-process safe read-modify-write:
//! cfg.get("counters.starts")?
//!     .with_lock(|counter| async move { counter.add(1).await })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod path;
pub mod section;
pub mod store;
pub mod value;

pub mod test_utils;

pub use config::{configure, default_pool, Config, Pool};
pub use error::{Error, Result};
pub use lock::{LockHandle, LockManager, LockMode, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_LEASE};
pub use path::Path;
pub use section::{Children, LockedSection, Section};
pub use store::{KeyTtl, MemoryStore, Store};

/// Section for the root of the default pool's default database.
pub fn root() -> Section {
    Section::root(&default_pool(), None)
}

/// Section for a dotted path in the default pool's default database.
/// A good idiom for a service is `section(module_path!())`-style unique
/// top-level names.
pub fn section(path: &str) -> Result<Section> {
    Section::open(&default_pool(), None, path)
}
