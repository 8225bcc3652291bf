//! Timer-driven sweep engine shared by the LRU and LFU policies.
//!
//! The engine owns the entry map and two background workers: an expiry
//! sweep that removes entries older than the cache timeout, and a pressure
//! sweep that forces evictions while usage sits above the high-water
//! threshold. The concrete ordering of victims is supplied by an
//! [`EvictionOrder`] implementation; everything else is common.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::config::PolicyConfig;
use crate::cache::path_locks::PathLocks;
use crate::cache::shadow;
use crate::cache::shadow::ExclusiveProbe;

/// Shortest sweep period. Keeps a zero or tiny `timeout-sec` from turning
/// the workers into busy loops.
const MIN_TICK: Duration = Duration::from_secs(1);
/// How often disk usage is sampled.
const DISK_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Victims fetched per round of a pressure pass.
const VICTIM_BATCH: usize = 64;

/// Per-entry bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    /// When the entry was last validated. Distinct from the file's mtime.
    pub last_used: Instant,
    /// How many times the entry was validated.
    pub uses: u64,
}

/// Victim ordering plugged into the sweep engine.
pub trait EvictionOrder: Send + Sync + 'static {
    /// Name the policy is selected by in configuration.
    const NAME: &'static str;

    /// Record a touch of `path`, inserting it if unknown.
    fn touch(entries: &mut LinkedHashMap<PathBuf, EntryMeta>, path: &Path);

    /// Up to `n` victims for capacity eviction, most evictable first.
    fn capacity_victims(entries: &LinkedHashMap<PathBuf, EntryMeta>, n: usize) -> Vec<PathBuf>;
}

struct Shared {
    entries: Mutex<LinkedHashMap<PathBuf, EntryMeta>>,
    cfg: RwLock<PolicyConfig>,
    locks: Arc<PathLocks>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The shared sweep engine. Instantiated as
/// [`LruPolicy`](crate::cache::eviction::LruPolicy) and
/// [`LfuPolicy`](crate::cache::eviction::LfuPolicy).
pub struct SweepPolicy<O: EvictionOrder> {
    shared: Arc<Shared>,
    _order: PhantomData<O>,
}

#[expect(
    clippy::expect_used,
    reason = "engine mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl<O: EvictionOrder> SweepPolicy<O> {
    #[must_use]
    pub fn new(cfg: PolicyConfig, locks: Arc<PathLocks>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(LinkedHashMap::new()),
                cfg: RwLock::new(cfg),
                locks,
                stop: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            }),
            _order: PhantomData,
        }
    }

    fn cfg_snapshot(shared: &Shared) -> PolicyConfig {
        shared.cfg.read().expect("poisoned").clone()
    }

    /// Remove one entry, honoring the locking protocol: take the path's
    /// logical lock, then probe the advisory lock non-blocking. A busy
    /// advisory lock means a handle is using the file; the entry is
    /// re-marked so it stops being the first victim.
    async fn try_evict(shared: &Shared, local: &Path, trace: bool, reason: &'static str) -> bool {
        let logical = {
            let cfg = shared.cfg.read().expect("poisoned");
            shadow::logical_of(&cfg.tmp_path, local)
        };
        let _guard = shared.locks.lock(&logical).await;

        let file = match std::fs::File::open(local) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Shadow file already gone; just forget it.
                shared.entries.lock().expect("poisoned").remove(local);
                return true;
            }
            Err(e) => {
                warn!(path = ?local, error = %e, "cannot open eviction candidate");
                return false;
            }
        };

        match shadow::try_lock_exclusive(file) {
            Ok(ExclusiveProbe::Acquired(lock)) => {
                if let Err(e) = std::fs::remove_file(local) {
                    warn!(path = ?local, error = %e, "failed to remove evicted file");
                }
                drop(lock);
                shared.entries.lock().expect("poisoned").remove(local);
                if trace {
                    info!(path = ?local, policy = O::NAME, reason, "evicted shadow file");
                }
                true
            }
            Ok(ExclusiveProbe::Busy(_)) => {
                if trace {
                    info!(path = ?local, policy = O::NAME, "eviction skipped, file in use");
                }
                O::touch(&mut shared.entries.lock().expect("poisoned"), local);
                false
            }
            Err(errno) => {
                warn!(path = ?local, error = %errno, "advisory lock probe failed");
                false
            }
        }
    }

    async fn sweep_expired(shared: &Shared) {
        let cfg = Self::cfg_snapshot(shared);
        let victims: Vec<PathBuf> = {
            let entries = shared.entries.lock().expect("poisoned");
            entries
                .iter()
                .filter(|(_, meta)| meta.last_used.elapsed() > cfg.cache_timeout)
                .map(|(path, _)| path.clone())
                .collect()
        };
        for victim in victims {
            Self::try_evict(shared, &victim, cfg.policy_trace, "expired").await;
        }
    }

    /// Current usage relative to the configured soft cap, or to the disk
    /// holding the temp root when no cap is set.
    async fn usage_percent(cfg: &PolicyConfig) -> Option<f64> {
        if cfg.max_size_mb > 0.0 {
            #[expect(
                clippy::cast_precision_loss,
                reason = "cache sizes far below 2^52 bytes"
            )]
            let used_mb = shadow::dir_size_bytes(&cfg.tmp_path).await as f64 / (1024.0 * 1024.0);
            Some(used_mb / cfg.max_size_mb * 100.0)
        } else {
            shadow::disk_usage_percent(&cfg.tmp_path)
        }
    }

    async fn sweep_pressure(shared: &Shared) {
        let cfg = Self::cfg_snapshot(shared);
        let Some(usage) = Self::usage_percent(&cfg).await else {
            return;
        };
        if usage <= cfg.high_threshold {
            return;
        }
        if cfg.policy_trace {
            info!(
                usage,
                high = cfg.high_threshold,
                policy = O::NAME,
                "usage above high threshold, forcing eviction"
            );
        }

        let mut processed = 0u32;
        'pass: while processed < cfg.max_eviction {
            let batch = {
                let entries = shared.entries.lock().expect("poisoned");
                O::capacity_victims(&entries, VICTIM_BATCH)
            };
            if batch.is_empty() {
                break;
            }

            let mut progressed = false;
            for victim in batch {
                if processed >= cfg.max_eviction {
                    break 'pass;
                }
                processed += 1;
                if Self::try_evict(shared, &victim, cfg.policy_trace, "pressure").await {
                    progressed = true;
                    match Self::usage_percent(&cfg).await {
                        Some(usage) if usage >= cfg.low_threshold => {}
                        _ => break 'pass,
                    }
                }
            }
            if !progressed {
                // Every candidate in this round was in use.
                break;
            }
        }
    }

    async fn expiry_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
        loop {
            let period = {
                let cfg = shared.cfg.read().expect("poisoned");
                cfg.cache_timeout.max(MIN_TICK)
            };
            tokio::select! {
                _ = stop.changed() => break,
                () = tokio::time::sleep(period) => {}
            }
            Self::sweep_expired(&shared).await;
        }
        debug!(policy = O::NAME, "expiry sweep stopped");
    }

    async fn pressure_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                () = tokio::time::sleep(DISK_CHECK_INTERVAL) => {}
            }
            Self::sweep_pressure(&shared).await;
        }
        debug!(policy = O::NAME, "pressure sweep stopped");
    }
}

#[async_trait::async_trait]
#[expect(
    clippy::expect_used,
    reason = "engine mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl<O: EvictionOrder> super::CachePolicy for SweepPolicy<O> {
    fn name(&self) -> &'static str {
        O::NAME
    }

    async fn start(&self) {
        let mut stop_slot = self.shared.stop.lock().expect("poisoned");
        if stop_slot.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        *stop_slot = Some(tx);
        drop(stop_slot);

        let mut workers = self.shared.workers.lock().expect("poisoned");
        workers.push(tokio::spawn(Self::expiry_loop(
            Arc::clone(&self.shared),
            rx.clone(),
        )));
        workers.push(tokio::spawn(Self::pressure_loop(
            Arc::clone(&self.shared),
            rx,
        )));
    }

    async fn shutdown(&self) {
        if let Some(tx) = self.shared.stop.lock().expect("poisoned").take() {
            let _ = tx.send(true);
        }
        let workers = std::mem::take(&mut *self.shared.workers.lock().expect("poisoned"));
        for worker in workers {
            let _ = worker.await;
        }
    }

    fn mark_valid(&self, local_path: &Path) {
        O::touch(&mut self.shared.entries.lock().expect("poisoned"), local_path);
    }

    async fn mark_invalidated(&self, local_path: &Path) {
        let (timeout, trace) = {
            let cfg = self.shared.cfg.read().expect("poisoned");
            (cfg.cache_timeout, cfg.policy_trace)
        };
        if timeout.is_zero() {
            // Nothing ever ages out with a zero timeout, so the entry is
            // removed now. The full eviction protocol applies: another
            // handle may hold the file open, and a busy probe must leave
            // it alone.
            Self::try_evict(&self.shared, local_path, trace, "invalidated").await;
        } else {
            O::touch(&mut self.shared.entries.lock().expect("poisoned"), local_path);
        }
    }

    async fn purge(&self, local_path: &Path) {
        self.shared.entries.lock().expect("poisoned").remove(local_path);
        match tokio::fs::remove_file(local_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?local_path, error = %e, "failed to remove purged file"),
        }
        if self.shared.cfg.read().expect("poisoned").policy_trace {
            info!(path = ?local_path, policy = O::NAME, "purged shadow file");
        }
    }

    fn is_cached(&self, local_path: &Path) -> bool {
        self.shared
            .entries
            .lock()
            .expect("poisoned")
            .contains_key(local_path)
    }

    fn update_config(&self, cfg: PolicyConfig) {
        *self.shared.cfg.write().expect("poisoned") = cfg;
    }
}
