// src/cache/entry.rs
//! Reference-counted cache entries.

use super::key::CacheKey;
use crate::block::Block;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A block held by the cache under a key.
///
/// The reference count is the entry's pin count: while it is above zero the
/// entry cannot be evicted, removed or cleared. `last_access` is a
/// monotonic tick assigned by the cache on every hit; eviction picks the
/// unpinned entry with the smallest tick.
pub struct CachedBlock {
    key: CacheKey,
    block: Arc<dyn Block>,
    ref_count: AtomicUsize,
    last_access: AtomicU64,
}

impl CachedBlock {
    /// A fresh entry starts pinned once by its creator.
    pub(crate) fn new(key: CacheKey, block: Arc<dyn Block>, tick: u64) -> Self {
        Self {
            key,
            block,
            ref_count: AtomicUsize::new(1),
            last_access: AtomicU64::new(tick),
        }
    }

    /// The entry's key.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The cached block.
    pub fn block(&self) -> &Arc<dyn Block> {
        &self.block
    }

    /// Current pin count.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one pin, saturating at zero.
    pub(crate) fn unpin(&self) {
        let _ = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Release);
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CachedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBlock")
            .field("key", &self.key)
            .field("ref_count", &self.ref_count())
            .field("last_access", &self.last_access())
            .finish()
    }
}
