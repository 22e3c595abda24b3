//! Bounded build record cache with disk fallback
//!
//! Lookups hit the in-memory LRU map first, then a negative set of numbers
//! known to have no record, and finally the disk through a single-flight
//! loader. Running builds are pinned: they are always resident and never
//! chosen for eviction.

use crate::coordinator::SingleFlight;
use crate::record::{Build, RecordStore};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of a background disk load
#[derive(Debug, Clone, Default)]
pub enum LoadOutcome {
    Found(Arc<Build>),
    /// No file, or a file that could not be decoded
    Missing,
    /// Transient failure; do not remember
    #[default]
    Failed,
}

#[derive(Debug)]
struct CacheState {
    /// Least recently used first
    entries: IndexMap<u64, Arc<Build>>,
    pinned: HashSet<u64>,
    missing: HashSet<u64>,
    capacity: usize,
}

impl CacheState {
    fn touch(&mut self, number: u64) -> Option<Arc<Build>> {
        let index = self.entries.get_index_of(&number)?;
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        self.entries.get(&number).cloned()
    }

    fn put(&mut self, build: Arc<Build>) {
        let number = build.number();
        self.missing.remove(&number);
        self.entries.shift_remove(&number);
        self.entries.insert(number, build);
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .keys()
                .copied()
                .find(|number| !self.pinned.contains(number));
            match victim {
                Some(number) => {
                    self.entries.shift_remove(&number);
                    debug!("Evicted build #{} from record cache", number);
                }
                // everything left is running
                None => break,
            }
        }
    }
}

/// In-memory view over one builder's build records
pub struct BuildRecordCache {
    builder: String,
    store: Arc<RecordStore>,
    state: Mutex<CacheState>,
    loads: SingleFlight<u64, LoadOutcome>,
}

impl BuildRecordCache {
    pub fn new(builder: impl Into<String>, store: Arc<RecordStore>, capacity: usize) -> Self {
        Self {
            builder: builder.into(),
            store,
            state: Mutex::new(CacheState {
                entries: IndexMap::new(),
                pinned: HashSet::new(),
                missing: HashSet::new(),
                capacity,
            }),
            loads: SingleFlight::new("build load"),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        state.evict();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Whether `number` is resident in memory
    pub fn contains(&self, number: u64) -> bool {
        self.state.lock().entries.contains_key(&number)
    }

    /// Resident build numbers, least recently used first
    pub fn numbers(&self) -> Vec<u64> {
        self.state.lock().entries.keys().copied().collect()
    }

    /// Resident builds, least recently used first
    pub fn builds(&self) -> Vec<Arc<Build>> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Whether `number` is remembered as having no record
    pub fn is_known_missing(&self, number: u64) -> bool {
        self.state.lock().missing.contains(&number)
    }

    /// Resident build without touching recency
    pub fn peek(&self, number: u64) -> Option<Arc<Build>> {
        self.state.lock().entries.get(&number).cloned()
    }

    /// Insert a build directly, bypassing the loader
    pub fn insert(&self, build: Arc<Build>) {
        self.state.lock().put(build);
    }

    /// Insert a running build and protect it from eviction
    pub fn pin(&self, build: Arc<Build>) {
        let mut state = self.state.lock();
        state.pinned.insert(build.number());
        state.put(build);
    }

    /// Make a finished build evictable again
    pub fn unpin(&self, number: u64) {
        let mut state = self.state.lock();
        state.pinned.remove(&number);
        state.evict();
    }

    /// Build `number`, loading it from disk if needed.
    ///
    /// `next_number` is the builder's allocation counter: only numbers below
    /// it are remembered as missing, since higher ones may still be created.
    pub async fn get(&self, number: u64, next_number: u64) -> Option<Arc<Build>> {
        {
            let mut state = self.state.lock();
            if let Some(build) = state.touch(number) {
                return Some(build);
            }
            if state.missing.contains(&number) {
                return None;
            }
        }

        let store = self.store.clone();
        let builder = self.builder.clone();
        let outcome = self
            .loads
            .run(number, move || load_from_disk(store, builder, number))
            .await;

        let mut state = self.state.lock();
        match outcome {
            LoadOutcome::Found(build) => {
                // Another waiter may have inserted it already; keep one instance.
                if let Some(resident) = state.touch(number) {
                    return Some(resident);
                }
                state.put(build.clone());
                Some(build)
            }
            LoadOutcome::Missing => {
                if number < next_number {
                    state.missing.insert(number);
                }
                None
            }
            LoadOutcome::Failed => None,
        }
    }
}

async fn load_from_disk(store: Arc<RecordStore>, builder: String, number: u64) -> LoadOutcome {
    match store.load_build(number).await {
        Ok(None) => LoadOutcome::Missing,
        Ok(Some(decoded)) => {
            if let Some(version) = decoded.migrated_from {
                info!(
                    "Re-writing build #{} of {} upgraded from schema v{}",
                    number, builder, version
                );
                if let Err(e) = store.save_build(&decoded.record).await {
                    error!("Failed to re-write upgraded build #{} of {}: {}", number, builder, e);
                }
            }
            LoadOutcome::Found(Arc::new(Build::from_record(decoded.record)))
        }
        Err(e) if e.is_absent() => {
            warn!("Treating build #{} of {} as missing: {}", number, builder, e);
            LoadOutcome::Missing
        }
        Err(e) => {
            warn!("Failed to load build #{} of {}: {}", number, builder, e);
            LoadOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BuildRecord, BuildResult};
    use tempfile::TempDir;

    fn test_cache(capacity: usize) -> (BuildRecordCache, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::new(temp.path(), 4));
        (BuildRecordCache::new("linux", store, capacity), temp)
    }

    fn finished(number: u64) -> BuildRecord {
        let mut record = BuildRecord::new("linux", number);
        record.finished = true;
        record.result = Some(BuildResult::Success);
        record
    }

    #[test]
    fn lru_eviction_skips_pinned() {
        let (cache, _temp) = test_cache(2);
        cache.pin(Arc::new(Build::new("linux", 1)));
        cache.insert(Arc::new(Build::new("linux", 2)));
        cache.insert(Arc::new(Build::new("linux", 3)));

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn all_pinned_may_exceed_capacity() {
        let (cache, _temp) = test_cache(1);
        cache.pin(Arc::new(Build::new("linux", 1)));
        cache.pin(Arc::new(Build::new("linux", 2)));
        assert_eq!(cache.len(), 2);

        cache.unpin(1);
        assert_eq!(cache.numbers(), vec![2]);
    }

    #[tokio::test]
    async fn access_refreshes_recency() {
        let (cache, _temp) = test_cache(2);
        cache.insert(Arc::new(Build::new("linux", 1)));
        cache.insert(Arc::new(Build::new("linux", 2)));

        assert!(cache.get(1, 10).await.is_some());
        cache.insert(Arc::new(Build::new("linux", 3)));

        assert_eq!(cache.numbers(), vec![1, 3]);
    }

    #[tokio::test]
    async fn concurrent_misses_read_disk_once() {
        let (cache, _temp) = test_cache(10);
        cache.store().save_build(&finished(4)).await.unwrap();

        let (a, b, c, d) = tokio::join!(
            cache.get(4, 10),
            cache.get(4, 10),
            cache.get(4, 10),
            cache.get(4, 10)
        );
        let (a, b, c, d) = (a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap());

        assert_eq!(cache.store().disk_reads(), 1);
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c) && Arc::ptr_eq(&c, &d));
        assert_eq!(a.result(), Some(BuildResult::Success));
    }

    #[tokio::test]
    async fn missing_numbers_are_remembered_below_counter() {
        let (cache, _temp) = test_cache(10);

        assert!(cache.get(3, 10).await.is_none());
        assert!(cache.is_known_missing(3));

        assert!(cache.get(12, 10).await.is_none());
        assert!(!cache.is_known_missing(12));
    }

    #[tokio::test]
    async fn corrupted_records_degrade_to_missing() {
        let (cache, _temp) = test_cache(10);
        tokio::fs::write(cache.store().build_path(2), b"not json").await.unwrap();

        assert!(cache.get(2, 10).await.is_none());
        assert!(cache.is_known_missing(2));
    }

    #[tokio::test]
    async fn upgraded_records_are_rewritten() {
        let (cache, _temp) = test_cache(10);
        let legacy = serde_json::json!({
            "number": 6,
            "builder": "linux",
            "finished": true,
            "results": 0,
            "sourcestamps": [],
            "times": [1000.0, 1100.0],
            "steps": []
        });
        tokio::fs::write(cache.store().build_path(6), legacy.to_string())
            .await
            .unwrap();

        let build = cache.get(6, 10).await.unwrap();
        assert_eq!(build.result(), Some(BuildResult::Success));

        let raw = tokio::fs::read_to_string(cache.store().build_path(6)).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["schema_version"], crate::record::CURRENT_SCHEMA_VERSION);
    }
}
