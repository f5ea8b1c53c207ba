//! Write-coalescing staleness cache.
//!
//! Collections opted into caching keep the last-applied record per id in
//! memory. An update landing within the staleness window of the previous
//! one is merged and returned without touching the durable store; the
//! merge reaches durability with the next out-of-window write. A crash
//! inside the window can lose the most recent merges — bounded-lag
//! durability is the contract.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tokio::sync::Mutex;

use crate::entity::Record;

/// How long a merged in-memory update is considered fresh enough to skip
/// the durable store.
pub const STALENESS_WINDOW_MS: i64 = 60_000;

/// Outcome of applying an update against the cache.
#[derive(Debug)]
pub enum CacheOutcome {
    /// A cached entry existed and the merge landed inside the window:
    /// the merged record is the caller's result, no durable write.
    Fresh(Record),
    /// A cached entry existed but the window elapsed: the merged record
    /// must be written through. The cache already holds the merge.
    Stale(Record),
    /// No cached entry; the caller writes through and populates the cache
    /// with the durable result.
    Miss,
}

struct CacheEntry {
    record: Record,
    updated_at: i64,
}

/// Per-collection map from entity id to last-applied record. Entries are
/// created lazily on first update and only ever overwritten, never
/// evicted.
#[derive(Default)]
pub struct StalenessCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl StalenessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `changes` over the cached record for `id`, if one exists, and
    /// decide whether the durable store must be touched. `changes` is
    /// expected to carry the engine's fresh `updatedAt` stamp; that stamp
    /// becomes the entry's new timestamp.
    pub async fn apply(&self, id: &str, changes: &Record) -> CacheOutcome {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(id) else {
            return CacheOutcome::Miss;
        };

        let prior_updated_at = entry.updated_at;
        let mut merged = entry.record.clone();
        merged.merge(changes);
        let merged_at = merged.updated_at().unwrap_or(prior_updated_at);

        entry.record = merged.clone();
        entry.updated_at = merged_at;

        if merged_at - prior_updated_at < STALENESS_WINDOW_MS {
            CacheOutcome::Fresh(merged)
        } else {
            CacheOutcome::Stale(merged)
        }
    }

    /// First-write population: store the durable result for an id that had
    /// no entry when the update began. An entry that appeared in the
    /// meantime wins — it holds a newer merge.
    pub async fn populate(&self, id: &str, record: Record) {
        let mut entries = self.entries.lock().await;
        if let Entry::Vacant(slot) = entries.entry(id.to_string()) {
            let updated_at = record.updated_at().unwrap_or(0);
            slot.insert(CacheEntry { record, updated_at });
        }
    }

    /// The cached record for an id, if any. Test/diagnostic helper.
    pub async fn peek(&self, id: &str) -> Option<Record> {
        let entries = self.entries.lock().await;
        entries.get(id).map(|e| e.record.clone())
    }
}
