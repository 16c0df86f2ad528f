// src/cache/cache.rs
//! Keyed LRU cache over reference-counted blocks.
//!
//! `get` returns a *handle*, not a guarantee of data: on a miss the entry's
//! block starts empty and `InProgress`, and readers must await its readiness
//! before touching the contents. Pinned entries (reference count above zero)
//! are never evicted; eviction recycles the least-recently-used unpinned
//! entry's block through the pool.

use super::config::CacheConfig;
use super::entry::CachedBlock;
use super::key::CacheKey;
use super::stats::CacheStats;
use crate::block::Block;
use crate::context::CancelContext;
use crate::download::{
    AsyncDownloadManager, DownloadRequest, DownloadStatus, DownloadTarget, DownloadTask,
};
use crate::error::{CacheError, Result};
use crate::pool::{BlockPool, MemoryBudget};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a find-or-download lookup.
pub enum Lookup {
    /// The key was cached; the entry is pinned for the caller
    Hit(Arc<CachedBlock>),
    /// A download was scheduled (or was already in flight); the entry stays
    /// pinned by the task until it reaches a terminal state
    Scheduled(Arc<DownloadTask>),
}

impl std::fmt::Debug for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hit(entry) => f.debug_tuple("Hit").field(entry.key()).finish(),
            Self::Scheduled(task) => f.debug_tuple("Scheduled").field(task.key()).finish(),
        }
    }
}

struct CacheInner {
    map: HashMap<CacheKey, Arc<CachedBlock>>,
    /// Monotonic access counter backing LRU order.
    tick: u64,
}

/// Keyed LRU cache with pinned-entry protection and optional asynchronous
/// downloads.
pub struct BlockCache {
    config: CacheConfig,
    pool: BlockPool,
    inner: Mutex<CacheInner>,
    manager: Mutex<Option<Arc<AsyncDownloadManager>>>,
}

impl BlockCache {
    /// Builds a cache and its backing pool, reserving the pool's slot in
    /// `budget`.
    pub fn new(config: CacheConfig, budget: Arc<MemoryBudget>) -> Result<Self> {
        config.validate()?;
        let pool = BlockPool::new(config.pool_config(), budget)?;
        Ok(Self {
            config,
            pool,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                tick: 0,
            }),
            manager: Mutex::new(None),
        })
    }

    /// Attaches a download manager for the `*_download` operations and
    /// [`get_or_schedule`](Self::get_or_schedule).
    pub fn bind_manager(&self, manager: Arc<AsyncDownloadManager>) {
        *self.manager.lock() = Some(manager);
    }

    fn manager(&self) -> Result<Arc<AsyncDownloadManager>> {
        self.manager.lock().clone().ok_or(CacheError::NotConfigured)
    }

    /// Looks up `key`, pinning and returning the entry.
    ///
    /// On a miss a fresh entry is created (pinned once for the caller)
    /// around a pool block; when the pool is exhausted the least-recently-
    /// used unpinned entry is evicted first. Fails with
    /// [`CacheError::NoEvictable`] when every entry is pinned.
    pub fn get(&self, key: &CacheKey) -> Result<Arc<CachedBlock>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.map.get(key) {
            entry.pin();
            entry.touch(tick);
            return Ok(Arc::clone(entry));
        }

        let block = self.acquire_block_locked(&mut inner)?;
        let entry = Arc::new(CachedBlock::new(key.clone(), block, tick));
        inner.map.insert(key.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Takes a block for a new entry, evicting once if the pool is tapped
    /// out. Caller holds the cache lock, so eviction's release cannot be
    /// stolen by a competing miss.
    fn acquire_block_locked(&self, inner: &mut CacheInner) -> Result<Arc<dyn Block>> {
        if let Some(block) = self.pool.try_get()? {
            return Ok(block);
        }
        self.evict_lru_locked(inner)?;
        self.pool.try_get()?.ok_or(CacheError::CannotAllocate)
    }

    /// Evicts the unpinned entry with the oldest access tick.
    fn evict_lru_locked(&self, inner: &mut CacheInner) -> Result<()> {
        let victim = inner
            .map
            .values()
            .filter(|entry| entry.ref_count() == 0)
            .min_by_key(|entry| entry.last_access())
            .map(|entry| entry.key().clone())
            .ok_or(CacheError::NoEvictable)?;

        let entry = inner
            .map
            .remove(&victim)
            .expect("eviction victim vanished under the cache lock");
        debug!(key = %victim, "evicting least-recently-used block");
        self.pool.release(Arc::clone(entry.block()))
    }

    /// Drops one pin from `entry`. LRU order is untouched; ready-to-evict
    /// status changes only through the reference count reaching zero.
    pub fn release(&self, entry: &CachedBlock) {
        entry.unpin();
    }

    /// Removes `key` if present and unpinned. Absent keys are a no-op;
    /// pinned entries fail with [`CacheError::BlockInUse`].
    pub fn remove(&self, key: &CacheKey) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.map.get(key) {
            None => Ok(()),
            Some(entry) if entry.ref_count() > 0 => Err(CacheError::BlockInUse),
            Some(_) => {
                let entry = inner.map.remove(key).expect("entry vanished under the cache lock");
                self.pool.release(Arc::clone(entry.block()))
            }
        }
    }

    /// Empties the cache, returning every block to the pool, and signals a
    /// bound download manager to shut down.
    ///
    /// Fails with [`CacheError::BlockInUse`] if any entry is still pinned.
    pub fn clear(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.map.values().any(|entry| entry.ref_count() > 0) {
                return Err(CacheError::BlockInUse);
            }
            for (_, entry) in inner.map.drain() {
                self.pool.release(Arc::clone(entry.block()))?;
            }
        }
        if let Some(manager) = self.manager.lock().as_ref() {
            manager.shutdown();
        }
        Ok(())
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let in_use = inner
            .map
            .values()
            .filter(|entry| entry.ref_count() > 0)
            .count();
        let total = self.pool.total_blocks();
        CacheStats {
            total,
            max: self.config.max_blocks,
            in_use,
            available: total - in_use,
        }
    }

    /// [`clear`](Self::clear) followed by draining the pool's free list.
    /// The pool keeps its reserved budget permit.
    pub fn destroy(&self) -> Result<()> {
        self.clear()?;
        self.pool.clear_free(false)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Download delegation
    // ------------------------------------------------------------------

    /// Finds `key` in the cache or schedules its download.
    ///
    /// On a miss the fresh entry's creator pin transfers to the task and is
    /// released when the task reaches a terminal state, so the entry cannot
    /// be evicted out from under an in-flight download.
    pub fn get_or_schedule(&self, ctx: &CancelContext, request: DownloadRequest) -> Result<Lookup> {
        let manager = self.manager()?;
        let key = request.effective_key();

        let entry = {
            let mut inner = self.inner.lock();
            inner.tick += 1;
            let tick = inner.tick;

            if let Some(entry) = inner.map.get(&key) {
                entry.pin();
                entry.touch(tick);
                return Ok(Lookup::Hit(Arc::clone(entry)));
            }

            let block = self.acquire_block_locked(&mut inner)?;
            let entry = Arc::new(CachedBlock::new(key.clone(), block, tick));
            inner.map.insert(key.clone(), Arc::clone(&entry));
            entry
        };

        let target = DownloadTarget::Entry(Arc::downgrade(&entry));
        match manager.schedule_inner(ctx, request, target) {
            Ok((task, true)) => Ok(Lookup::Scheduled(task)),
            Ok((task, false)) => {
                // A task for this key was already in flight; it does not
                // hold our fresh entry, so keep nothing pinned.
                entry.unpin();
                Ok(Lookup::Scheduled(task))
            }
            Err(e) => {
                entry.unpin();
                let _ = self.remove(&key);
                Err(e)
            }
        }
    }

    /// Submits a download through the bound manager.
    pub fn schedule_download(
        &self,
        ctx: &CancelContext,
        request: DownloadRequest,
        target: DownloadTarget,
    ) -> Result<Arc<DownloadTask>> {
        self.manager()?.schedule(ctx, request, target)
    }

    /// Status of the download registered under `key`.
    pub fn get_download_status(&self, key: &CacheKey) -> Result<Option<DownloadStatus>> {
        Ok(self.manager()?.get_status(key))
    }

    /// Cancels the download registered under `key`.
    pub fn cancel_download(&self, key: &CacheKey) -> Result<()> {
        self.manager()?.cancel(key);
        Ok(())
    }

    /// Keys of all in-flight downloads.
    pub fn list_active_downloads(&self) -> Result<Vec<CacheKey>> {
        Ok(self.manager()?.list_active())
    }

    /// Drops terminal tasks from the manager's index.
    pub fn cleanup_completed(&self) -> Result<usize> {
        Ok(self.manager()?.cleanup_completed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BlockType;

    fn cache(max_blocks: usize, budget_permits: usize) -> BlockCache {
        BlockCache::new(
            CacheConfig {
                block_size: 1024,
                max_blocks,
                block_type: BlockType::Memory,
            },
            Arc::new(MemoryBudget::new(budget_permits)),
        )
        .unwrap()
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let budget = Arc::new(MemoryBudget::new(4));
        let config = CacheConfig {
            block_size: 0,
            max_blocks: 4,
            block_type: BlockType::Memory,
        };
        assert!(matches!(
            BlockCache::new(config, budget),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_hit_returns_same_entry_pinned() {
        let cache = cache(4, 8);
        let k = key("a");

        let first = cache.get(&k).unwrap();
        let second = cache.get(&k).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);

        cache.release(&first);
        cache.release(&second);
        assert_eq!(first.ref_count(), 0);
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let cache = cache(4, 8);
        let entry = cache.get(&key("a")).unwrap();
        cache.release(&entry);
        cache.release(&entry);
        assert_eq!(entry.ref_count(), 0);
    }

    #[test]
    fn test_lru_eviction_respects_pins() {
        let cache = cache(5, 16);

        let keys: Vec<_> = (0..5).map(|i| key(&format!("k{}", i))).collect();
        let entries: Vec<_> = keys.iter().map(|k| cache.get(k).unwrap()).collect();
        for entry in &entries {
            cache.release(entry);
        }

        // Pool is full: the next miss must evict k0, the least recently used.
        let _new = cache.get(&key("knew")).unwrap();
        assert_eq!(cache.stats().total, 5);

        // k0 is gone; getting it again builds a distinct entry.
        let again = cache.get(&keys[0]).unwrap();
        assert!(!Arc::ptr_eq(&again, &entries[0]));
    }

    #[test]
    fn test_all_pinned_means_no_evictable() {
        let cache = cache(5, 16);

        let entries: Vec<_> = (0..5)
            .map(|i| cache.get(&key(&format!("k{}", i))).unwrap())
            .collect();

        assert_eq!(
            cache.get(&key("knew")).unwrap_err(),
            CacheError::NoEvictable
        );

        cache.release(&entries[0]);
        assert!(cache.get(&key("knew")).is_ok());
    }

    #[test]
    fn test_remove_semantics() {
        let cache = cache(4, 8);
        let k = key("a");

        // Absent key: no-op.
        cache.remove(&k).unwrap();

        let entry = cache.get(&k).unwrap();
        assert_eq!(cache.remove(&k).unwrap_err(), CacheError::BlockInUse);

        cache.release(&entry);
        cache.remove(&k).unwrap();

        // A fresh get builds a new entry.
        let again = cache.get(&k).unwrap();
        assert!(!Arc::ptr_eq(&again, &entry));
    }

    #[test]
    fn test_clear_fails_while_pinned() {
        let cache = cache(4, 8);
        let entry = cache.get(&key("a")).unwrap();

        assert_eq!(cache.clear().unwrap_err(), CacheError::BlockInUse);
        cache.release(&entry);
        cache.clear().unwrap();
        assert_eq!(cache.stats().in_use, 0);
    }

    #[test]
    fn test_stats_invariants_under_churn() {
        let cache = cache(4, 8);

        let held: Vec<_> = (0..3)
            .map(|i| cache.get(&key(&format!("k{}", i))).unwrap())
            .collect();

        let stats = cache.stats();
        assert_eq!(stats.in_use, 3);
        assert!(stats.in_use <= stats.total);
        assert!(stats.total <= stats.max);
        assert_eq!(stats.available, stats.total - stats.in_use);

        for entry in &held {
            cache.release(entry);
        }
        let stats = cache.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, stats.total);
    }

    #[test]
    fn test_destroy_drains_free_list_keeps_reservation() {
        let budget = Arc::new(MemoryBudget::new(4));
        let cache = BlockCache::new(
            CacheConfig {
                block_size: 1024,
                max_blocks: 3,
                block_type: BlockType::Memory,
            },
            Arc::clone(&budget),
        )
        .unwrap();

        let entry = cache.get(&key("a")).unwrap();
        cache.release(&entry);
        drop(entry);

        cache.destroy().unwrap();
        let stats = cache.stats();
        assert_eq!(stats.total, 0);
        // Reservation still held: one permit short of the full budget.
        assert_eq!(budget.available(), 3);
    }

    #[test]
    fn test_download_ops_require_manager() {
        let cache = cache(4, 8);
        let k = key("a");
        assert_eq!(
            cache.get_download_status(&k).unwrap_err(),
            CacheError::NotConfigured
        );
        assert_eq!(cache.cancel_download(&k).unwrap_err(), CacheError::NotConfigured);
        assert_eq!(
            cache.list_active_downloads().unwrap_err(),
            CacheError::NotConfigured
        );
        assert_eq!(cache.cleanup_completed().unwrap_err(), CacheError::NotConfigured);
    }

    #[test]
    fn test_disk_backed_cache() {
        let cache = BlockCache::new(
            CacheConfig {
                block_size: 4096,
                max_blocks: 2,
                block_type: BlockType::Disk,
            },
            Arc::new(MemoryBudget::new(4)),
        )
        .unwrap();

        let entry = cache.get(&key("d")).unwrap();
        entry.block().write(b"spilled to disk").unwrap();

        let mut buf = [0u8; 15];
        entry.block().read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"spilled to disk");
        cache.release(&entry);
    }

    #[test]
    fn test_smallest_configuration() {
        // block_size=1, max_blocks=1: everything stays well-defined.
        let cache = BlockCache::new(
            CacheConfig {
                block_size: 1,
                max_blocks: 1,
                block_type: BlockType::Memory,
            },
            Arc::new(MemoryBudget::new(1)),
        )
        .unwrap();

        let a = cache.get(&key("a")).unwrap();
        a.block().write(b"x").unwrap();
        assert_eq!(cache.get(&key("b")).unwrap_err(), CacheError::NoEvictable);

        cache.release(&a);
        let b = cache.get(&key("b")).unwrap();
        assert_eq!(b.block().size(), 0);
    }
}
