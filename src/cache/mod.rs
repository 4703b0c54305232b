//! Index handle cache
//!
//! Loading a page index is expensive (disk I/O plus rebuilding the in-memory
//! vector index), so handles are cached per index root and reused across
//! requests. Entries that stay idle longer than the configured timeout are
//! evicted by a periodic sweep (see [`CacheSweeper`]).
//!
//! Construction is serialized per key: concurrent misses for the same index
//! root share a single load. Callers receive an `Arc` to the handle, which acts
//! as a lease; a sweep never evicts a handle that is still leased.

mod sweeper;

pub use sweeper::CacheSweeper;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};

/// Builds index handles on a cache miss.
///
/// `load` is blocking and may take a long time; the cache always calls it on
/// the blocking thread pool.
pub trait IndexLoader: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    fn load(&self, index_path: &str, index_root: &str, device: &str) -> Result<Self::Handle>;
}

/// Cache timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Idle time after which an entry may be evicted
    pub timeout: Duration,
    /// Time between eviction sweeps
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

/// Slot shared by everyone waiting on the same key. Empty while loading.
type HandleCell<H> = Arc<OnceCell<Arc<H>>>;

struct CacheEntry<H> {
    cell: HandleCell<H>,
    last_access: Instant,
}

impl<H> CacheEntry<H> {
    fn pending(now: Instant) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            last_access: now,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_access = self.last_access.max(now);
    }

    /// Loaded, idle past `timeout` at `now`, and not leased by any caller.
    fn is_evictable(&self, now: Instant, timeout: Duration) -> bool {
        match self.cell.get() {
            Some(handle) => {
                now.saturating_duration_since(self.last_access) > timeout
                    && Arc::strong_count(handle) == 1
            }
            None => false,
        }
    }
}

type EntryMap<H> = Mutex<FxHashMap<String, CacheEntry<H>>>;

/// A caller's claim on a pending entry.
///
/// Dropping it while the cell is still empty (load failed, or the caller's
/// future was cancelled) removes the placeholder unless another caller is
/// still waiting on the same cell.
struct PendingSlot<'a, H> {
    entries: &'a EntryMap<H>,
    key: &'a str,
    cell: HandleCell<H>,
}

impl<H> Drop for PendingSlot<'_, H> {
    fn drop(&mut self) {
        if self.cell.get().is_some() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let abandoned = entries.get(self.key).is_some_and(|entry| {
            // The map and this slot hold the only references
            Arc::ptr_eq(&entry.cell, &self.cell) && Arc::strong_count(&self.cell) <= 2
        });
        if abandoned {
            entries.remove(self.key);
            debug!(index_root = self.key, "Dropped abandoned cache placeholder");
        }
    }
}

/// Cache of loaded index handles keyed by index root
pub struct ModelCache<L: IndexLoader> {
    loader: Arc<L>,
    config: CacheConfig,
    entries: EntryMap<L::Handle>,
    counters: CacheCounters,
}

impl<L: IndexLoader> ModelCache<L> {
    pub fn new(loader: L, config: CacheConfig) -> Self {
        Self {
            loader: Arc::new(loader),
            config,
            entries: Mutex::new(FxHashMap::default()),
            counters: CacheCounters::default(),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Return the cached handle for `index_root`, loading it on a miss.
    ///
    /// `index_path` and `device` are only used when a load is needed. A failed
    /// or cancelled load leaves no entry behind; errors go to the caller.
    pub async fn get_or_load(
        &self,
        index_path: &str,
        index_root: &str,
        device: &str,
    ) -> Result<Arc<L::Handle>> {
        let slot = {
            let mut entries = self.lock_entries();
            let entry = entries
                .entry(index_root.to_string())
                .or_insert_with(|| CacheEntry::pending(Instant::now()));

            if let Some(handle) = entry.cell.get().cloned() {
                entry.touch(Instant::now());
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(index_root = index_root, "Model cache hit");
                return Ok(handle);
            }
            PendingSlot {
                entries: &self.entries,
                key: index_root,
                cell: Arc::clone(&entry.cell),
            }
        };

        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        // On error or cancellation `slot` drops here and clears the placeholder.
        let handle = slot
            .cell
            .get_or_try_init(|| self.load(index_path, index_root, device))
            .await
            .map(Arc::clone)?;

        // A sweep cannot remove a pending entry, but a slow load may have
        // outlived an earlier entry for this key; put ours back if so.
        let mut entries = self.lock_entries();
        let entry = entries
            .entry(index_root.to_string())
            .or_insert_with(|| CacheEntry {
                cell: Arc::clone(&slot.cell),
                last_access: Instant::now(),
            });
        entry.touch(Instant::now());
        Ok(handle)
    }

    async fn load(&self, index_path: &str, index_root: &str, device: &str) -> Result<Arc<L::Handle>> {
        info!(
            index_root = index_root,
            index_path = index_path,
            device = device,
            "Loading index into model cache"
        );

        let loader = Arc::clone(&self.loader);
        let (path, root, dev) = (
            index_path.to_string(),
            index_root.to_string(),
            device.to_string(),
        );
        let handle = tokio::task::spawn_blocking(move || loader.load(&path, &root, &dev))
            .await
            .context("Index loader task failed")?
            .with_context(|| format!("Failed to load index '{}' from {}", index_path, index_root))?;

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(handle))
    }

    /// Evict idle entries using the current time.
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now())
    }

    /// Evict every entry idle for longer than the timeout as of `now`.
    ///
    /// All entries are judged against the same `now`. Entries that are still
    /// loading, or whose handle is leased by a caller, are kept. Returns the
    /// evicted keys.
    pub fn sweep_at(&self, now: Instant) -> Vec<String> {
        let timeout = self.config.timeout;
        let mut evicted = Vec::new();
        let mut released = Vec::new();

        {
            let mut entries = self.lock_entries();
            entries.retain(|key, entry| {
                if entry.is_evictable(now, timeout) {
                    evicted.push(key.clone());
                    released.push(Arc::clone(&entry.cell));
                    return false;
                }
                if entry.cell.get().is_some()
                    && now.saturating_duration_since(entry.last_access) > timeout
                {
                    debug!(index_root = %key, "Index handle still in use, deferring eviction");
                }
                true
            });
        }

        // Handles are dropped here, outside the lock.
        drop(released);

        for key in &evicted {
            info!(index_root = %key, "Cleared model for index from cache");
        }
        self.counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);

        evicted
    }

    pub fn contains(&self, index_root: &str) -> bool {
        self.lock_entries()
            .get(index_root)
            .is_some_and(|entry| entry.cell.get().is_some())
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, FxHashMap<String, CacheEntry<L::Handle>>> {
        // Entries hold no invariants that a panicking holder could break halfway.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_secs(3600);

    /// Loader that counts calls and fails for roots starting with "missing"
    #[derive(Default)]
    struct CountingLoader {
        calls: AtomicUsize,
        delay: Option<std::time::Duration>,
    }

    #[derive(Debug)]
    struct FakeHandle {
        root: String,
        serial: usize,
    }

    impl IndexLoader for CountingLoader {
        type Handle = FakeHandle;

        fn load(&self, _index_path: &str, index_root: &str, _device: &str) -> Result<FakeHandle> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let serial = self.calls.fetch_add(1, Ordering::SeqCst);
            if index_root.starts_with("missing") {
                anyhow::bail!("index not found at {}", index_root);
            }
            Ok(FakeHandle {
                root: index_root.to_string(),
                serial,
            })
        }
    }

    fn cache() -> ModelCache<CountingLoader> {
        ModelCache::new(CountingLoader::default(), CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_within_timeout_returns_same_handle() {
        let cache = cache();
        let t0 = Instant::now();

        let first = cache.get_or_load("idx", "A", "cpu").await.unwrap();
        tokio::time::advance(Duration::from_secs(3000)).await;
        let second = cache.get_or_load("idx", "A", "cpu").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.loader().calls.load(Ordering::SeqCst), 1);
        drop((first, second));

        // Idle 650s since the refresh at t=3000
        assert!(cache.sweep_at(t0 + Duration::from_secs(3650)).is_empty());
        assert!(cache.contains("A"));

        // Idle 3601s since the refresh
        let evicted = cache.sweep_at(t0 + Duration::from_secs(3000 + 3601));
        assert_eq!(evicted, vec!["A".to_string()]);
        assert!(!cache.contains("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_boundary_is_exclusive() {
        let cache = cache();
        let t0 = Instant::now();

        drop(cache.get_or_load("idx", "A", "cpu").await.unwrap());
        tokio::time::advance(Duration::from_secs(100)).await;
        drop(cache.get_or_load("idx", "B", "cpu").await.unwrap());

        // A idle 3700s, B idle exactly 3600s
        let evicted = cache.sweep_at(t0 + Duration::from_secs(3700));
        assert_eq!(evicted, vec!["A".to_string()]);
        assert!(cache.contains("B"));

        // B idle 3601s
        let evicted = cache.sweep_at(t0 + Duration::from_secs(3701));
        assert_eq!(evicted, vec!["B".to_string()]);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_by_one_second_is_evicted() {
        let cache = cache();
        let loaded_at = Instant::now();
        drop(cache.get_or_load("idx", "A", "cpu").await.unwrap());

        let now = loaded_at + TIMEOUT + Duration::from_secs(1);
        assert_eq!(cache.sweep_at(now), vec!["A".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_uses_single_snapshot() {
        let cache = cache();
        let t0 = Instant::now();
        for key in ["A", "B", "C"] {
            drop(cache.get_or_load("idx", key, "cpu").await.unwrap());
        }

        let mut evicted = cache.sweep_at(t0 + TIMEOUT + Duration::from_secs(1));
        evicted.sort();
        assert_eq!(evicted, vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_sweep_is_noop() {
        let cache = cache();
        drop(cache.get_or_load("idx", "A", "cpu").await.unwrap());
        tokio::time::advance(TIMEOUT + Duration::from_secs(10)).await;

        assert_eq!(cache.sweep().len(), 1);
        assert!(cache.sweep().is_empty());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_after_eviction_builds_new_handle() {
        let cache = cache();
        let first = cache.get_or_load("idx", "A", "cpu").await.unwrap();
        let first_serial = first.serial;
        drop(first);

        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;
        cache.sweep();

        let second = cache.get_or_load("idx", "A", "cpu").await.unwrap();
        assert_ne!(second.serial, first_serial);
        assert_eq!(second.root, "A");
        assert_eq!(cache.stats().loads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leased_handle_is_not_evicted() {
        let cache = cache();
        let lease = cache.get_or_load("idx", "A", "cpu").await.unwrap();
        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;

        assert!(cache.sweep().is_empty());
        assert!(cache.contains("A"));

        drop(lease);
        assert_eq!(cache.sweep(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_load_failure_leaves_no_entry() {
        let cache = cache();
        let result = cache.get_or_load("idx", "missing-root", "cpu").await;

        assert!(result.is_err());
        assert!(cache.is_empty());
        assert!(!cache.contains("missing-root"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_load_once() {
        let loader = CountingLoader {
            calls: AtomicUsize::new(0),
            delay: Some(std::time::Duration::from_millis(50)),
        };
        let cache = Arc::new(ModelCache::new(loader, CacheConfig::default()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_or_load("idx", "A", "cpu").await })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(cache.loader().calls.load(Ordering::SeqCst), 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.stats().loads, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_miss_leaves_no_entry() {
        let loader = CountingLoader {
            calls: AtomicUsize::new(0),
            delay: Some(std::time::Duration::from_millis(200)),
        };
        let cache = Arc::new(ModelCache::new(loader, CacheConfig::default()));

        let task = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_load("idx", "A", "cpu").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(cache.is_empty());
        assert_eq!(cache.stats().entries, 0);

        // The orphaned load finishes in the background without inserting anything
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(cache.is_empty());

        let handle = cache.get_or_load("idx", "A", "cpu").await.unwrap();
        assert_eq!(handle.root, "A");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_waiter_keeps_shared_load() {
        let loader = CountingLoader {
            calls: AtomicUsize::new(0),
            delay: Some(std::time::Duration::from_millis(200)),
        };
        let cache = Arc::new(ModelCache::new(loader, CacheConfig::default()));

        let spawn_load = || {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_load("idx", "A", "cpu").await })
        };
        let loader_task = spawn_load();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiter = spawn_load();
        tokio::time::sleep(Duration::from_millis(20)).await;

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(cache.len(), 1);

        let handle = loader_task.await.unwrap().unwrap();
        assert_eq!(handle.root, "A");
        assert!(cache.contains("A"));
        assert_eq!(cache.loader().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_count_hits_and_misses() {
        let cache = cache();
        drop(cache.get_or_load("idx", "A", "cpu").await.unwrap());
        drop(cache.get_or_load("idx", "A", "cpu").await.unwrap());
        drop(cache.get_or_load("idx", "B", "cpu").await.unwrap());

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.loads, 2);
    }
}
