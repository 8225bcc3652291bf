//! Least-frequently-used eviction.

use std::path::{Path, PathBuf};
use std::time::Instant;

use hashlink::LinkedHashMap;

use super::sweep::{EntryMeta, EvictionOrder, SweepPolicy};

/// Frequency ordering: victims are the entries with the fewest recorded
/// uses, ties broken by the older last-validated instant.
pub struct LfuOrder;

impl EvictionOrder for LfuOrder {
    const NAME: &'static str = "lfu";

    fn touch(entries: &mut LinkedHashMap<PathBuf, EntryMeta>, path: &Path) {
        let now = Instant::now();
        if let Some(meta) = entries.get_mut(path) {
            meta.last_used = now;
            meta.uses += 1;
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
        let mut ranked: Vec<(&PathBuf, &EntryMeta)> = entries.iter().collect();
        ranked.sort_by(|a, b| {
            a.1.uses
                .cmp(&b.1.uses)
                .then_with(|| a.1.last_used.cmp(&b.1.last_used))
        });
        ranked
            .into_iter()
            .take(n)
            .map(|(path, _)| path.clone())
            .collect()
    }
}

/// The LFU cache policy.
pub type LfuPolicy = SweepPolicy<LfuOrder>;
