//! Eviction policies for the shadow tree.
//!
//! A policy is the cache's memory of which shadow files are worth keeping.
//! The cache component reports every touch through [`CachePolicy`]; the
//! policy's background workers age entries out after `timeout-sec` and
//! force evictions when the disk fills past its thresholds.

/// Least-frequently-used ordering.
pub mod lfu;
/// Least-recently-used ordering.
pub mod lru;
mod sweep;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::cache::config::PolicyConfig;
use crate::cache::path_locks::PathLocks;

pub use lfu::LfuPolicy;
pub use lru::LruPolicy;
pub use sweep::{EntryMeta, EvictionOrder, SweepPolicy};

/// Capability interface of an eviction policy.
///
/// The policy keeps its own belief about the shadow tree: `mark_valid` and
/// `mark_invalidated` update that belief on the foreground path, while the
/// background workers started by `start` remove entries that expired or
/// must make room.
#[async_trait]
pub trait CachePolicy: Send + Sync {
    /// Policy name as selected in configuration.
    fn name(&self) -> &'static str;

    /// Launch the background sweep workers.
    async fn start(&self);

    /// Stop the background workers and wait for them to exit.
    async fn shutdown(&self);

    /// Note that the entry was just touched and holds a valid copy.
    fn mark_valid(&self, local_path: &Path);

    /// Signal that the entry may be removed by the background workers.
    ///
    /// With a zero cache timeout nothing can age out, so the entry is
    /// removed right away, through the same path-lock and advisory-probe
    /// protocol the sweeps use.
    async fn mark_invalidated(&self, local_path: &Path);

    /// Synchronously remove the shadow file and the policy's record of it.
    async fn purge(&self, local_path: &Path);

    /// Whether the policy believes a valid local copy exists.
    fn is_cached(&self, local_path: &Path) -> bool;

    /// Swap in a new configuration; takes effect on the next sweep.
    fn update_config(&self, cfg: PolicyConfig);
}

/// Build the policy selected by name. Unknown names fall back to LRU.
#[must_use]
pub fn create_policy(
    name: &str,
    cfg: PolicyConfig,
    locks: Arc<PathLocks>,
) -> Arc<dyn CachePolicy> {
    match name.to_ascii_lowercase().as_str() {
        "lru" | "" => Arc::new(LruPolicy::new(cfg, locks)),
        "lfu" => Arc::new(LfuPolicy::new(cfg, locks)),
        other => {
            info!(policy = other, "unknown eviction policy, falling back to lru");
            Arc::new(LruPolicy::new(cfg, locks))
        }
    }
}
