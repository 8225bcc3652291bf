//! Least-recently-used eviction.

use std::path::{Path, PathBuf};
use std::time::Instant;

use hashlink::LinkedHashMap;

use super::sweep::{EntryMeta, EvictionOrder, SweepPolicy};

/// Recency ordering: the entry map doubles as the LRU queue. Touching an
/// entry moves it to the back, so the front of the map is always the
/// least recently validated entry.
pub struct LruOrder;

impl EvictionOrder for LruOrder {
    const NAME: &'static str = "lru";

    fn touch(entries: &mut LinkedHashMap<PathBuf, EntryMeta>, path: &Path) {
        let now = Instant::now();
        if let Some(mut meta) = entries.remove(path) {
            meta.last_used = now;
            meta.uses += 1;
            entries.insert(path.to_path_buf(), meta);
        } else {
            entries.insert(
                path.to_path_buf(),
                EntryMeta {
                    last_used: now,
                    uses: 1,
                },
            );
        }
    }

    fn capacity_victims(entries: &LinkedHashMap<PathBuf, EntryMeta>, n: usize) -> Vec<PathBuf> {
        entries.iter().take(n).map(|(path, _)| path.clone()).collect()
    }
}

/// The LRU cache policy.
pub type LruPolicy = SweepPolicy<LruOrder>;
