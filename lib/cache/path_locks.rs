//! Per-path mutual exclusion for work that crosses local and remote state.
//!
//! Every operation that mutates a path's shadow file or its remote object
//! takes that path's lock first, so downloads, uploads, deletes and
//! evictions on one path are totally ordered while unrelated paths proceed
//! in parallel. Slots are created on first use and removed once the last
//! waiter releases, so the table stays proportional to in-flight work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;

struct Slot {
    /// Tasks currently holding or awaiting the slot. Mutated only under
    /// the table mutex.
    waiters: AtomicUsize,
    mutex: Arc<tokio::sync::Mutex<()>>,
}

/// Table of per-path locks, keyed by logical path.
///
/// Keys are normalised so `/a/b` and `a/b` name the same slot.
pub struct PathLocks {
    slots: Mutex<FxHashMap<String, Arc<Slot>>>,
}

/// Exclusive ownership of one path, released on drop.
///
/// Guards are scoped values, so a task holding several releases them in
/// reverse order of acquisition.
pub struct PathGuard<'a> {
    table: &'a PathLocks,
    key: String,
    permit: Option<OwnedMutexGuard<()>>,
}

fn key_of(path: &str) -> &str {
    path.trim_start_matches('/')
}

#[expect(
    clippy::expect_used,
    reason = "table mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl PathLocks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(FxHashMap::default()),
        }
    }

    /// Block until exclusive ownership of `path` is obtained.
    pub async fn lock(&self, path: &str) -> PathGuard<'_> {
        let key = key_of(path);
        let slot = {
            let mut slots = self.slots.lock().expect("poisoned");
            let slot = slots.entry(key.to_owned()).or_insert_with(|| {
                Arc::new(Slot {
                    waiters: AtomicUsize::new(0),
                    mutex: Arc::new(tokio::sync::Mutex::new(())),
                })
            });
            slot.waiters.fetch_add(1, Ordering::Relaxed);
            Arc::clone(slot)
        };

        // Await the slot mutex outside the table critical section, so a
        // long-held path lock never stalls lookups for unrelated paths.
        let permit = Arc::clone(&slot.mutex).lock_owned().await;

        PathGuard {
            table: self,
            key: key.to_owned(),
            permit: Some(permit),
        }
    }

    /// Non-blocking peek: whether someone currently holds `path`.
    ///
    /// Advisory only: a false negative is possible when a holder is
    /// between slot creation and mutex acquisition.
    #[must_use]
    pub fn locked(&self, path: &str) -> bool {
        let slots = self.slots.lock().expect("poisoned");
        match slots.get(key_of(path)) {
            Some(slot) => slot.mutex.try_lock().is_err(),
            None => false,
        }
    }

    fn release(&self, key: &str) {
        let mut slots = self.slots.lock().expect("poisoned");
        if let Some(slot) = slots.get(key) {
            if slot.waiters.fetch_sub(1, Ordering::Relaxed) == 1 {
                slots.remove(key);
            }
        }
    }
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // The permit must go first: releasing the waiter count while the
        // mutex is still held could retire the slot and mint a second
        // mutex for the same path.
        self.permit.take();
        self.table.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn lock_is_exclusive_per_path() {
        let locks = Arc::new(PathLocks::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let hits = Arc::clone(&hits);
            set.spawn(async move {
                let _guard = locks.lock("/a/b").await;
                let before = hits.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                let after = hits.load(Ordering::SeqCst);
                assert_eq!(before + 1, after, "no other task may enter the section");
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap();
        }
    }

    #[tokio::test]
    async fn different_paths_do_not_block_each_other() {
        let locks = PathLocks::new();
        let _a = locks.lock("/a").await;
        // A second path must be acquirable while /a is held.
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("/b")).await;
        assert!(b.is_ok(), "lock on /b should not wait on /a");
    }

    #[tokio::test]
    async fn locked_reflects_holder() {
        let locks = PathLocks::new();
        assert!(!locks.locked("/x"));

        let guard = locks.lock("/x").await;
        assert!(locks.locked("/x"));
        assert!(!locks.locked("/y"));

        drop(guard);
        assert!(!locks.locked("/x"));
    }

    #[tokio::test]
    async fn keys_are_normalised() {
        let locks = PathLocks::new();
        let _guard = locks.lock("/dir/file").await;
        assert!(locks.locked("dir/file"), "leading slash is insignificant");
    }

    #[tokio::test]
    async fn slot_is_retired_after_last_release() {
        let locks = PathLocks::new();
        {
            let _guard = locks.lock("/gone").await;
        }
        let slots = locks.slots.lock().unwrap();
        assert!(slots.is_empty(), "released slot should be removed");
    }
}
