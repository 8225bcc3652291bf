//! Background pool for recursive directory invalidation.
//!
//! Directory deletes and renames schedule a recursive walk of the affected
//! shadow subtree. The walk runs off the caller's path, but through a
//! bounded queue and a fixed set of workers, so a burst of directory
//! operations cannot fan out into unbounded tasks. Shutdown closes the
//! queue and waits for the workers to drain it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::eviction::CachePolicy;
use crate::cache::path_locks::PathLocks;
use crate::cache::shadow;

const QUEUE_DEPTH: usize = 128;
const WORKER_COUNT: usize = 2;

pub(crate) struct Invalidator {
    tx: Mutex<Option<mpsc::Sender<PathBuf>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[expect(
    clippy::expect_used,
    reason = "sender mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl Invalidator {
    /// Spawn the worker pool. The workers purge through `policy`, taking
    /// each file's lock in `locks` as they go.
    pub(crate) fn spawn(
        policy: Arc<dyn CachePolicy>,
        locks: Arc<PathLocks>,
        tmp_root: PathBuf,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<PathBuf>(QUEUE_DEPTH);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let tmp_root = Arc::new(tmp_root);

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for _ in 0..WORKER_COUNT {
            let rx = Arc::clone(&rx);
            let policy = Arc::clone(&policy);
            let locks = Arc::clone(&locks);
            let tmp_root = Arc::clone(&tmp_root);
            workers.push(tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(root) => {
                            shadow::invalidate_tree(&root, policy.as_ref(), &locks, &tmp_root)
                                .await;
                        }
                        None => break,
                    }
                }
            }));
        }

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a shadow subtree for invalidation. Applies backpressure when
    /// the queue is full; after shutdown the request is dropped with a
    /// warning.
    pub(crate) async fn schedule(&self, local_root: PathBuf) {
        let tx = self.tx.lock().expect("poisoned").clone();
        match tx {
            Some(tx) => {
                if tx.send(local_root).await.is_err() {
                    warn!("invalidation queue closed mid-send");
                }
            }
            None => warn!(path = ?local_root, "invalidation scheduled after shutdown"),
        }
    }

    /// Close the queue and wait for in-flight invalidations to finish.
    pub(crate) async fn drain(&self) {
        self.tx.lock().expect("poisoned").take();
        let workers = std::mem::take(&mut *self.workers.lock().expect("poisoned"));
        for worker in workers {
            let _ = worker.await;
        }
    }
}
