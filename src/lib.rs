// src/lib.rs
//! # Block Cache & Prefetch Engine
//!
//! Building blocks for POSIX-style adapters over remote object stores:
//! reads are satisfied by downloading contiguous byte ranges ("blocks")
//! into pooled local buffers, caching them by a content-addressed key and
//! streaming them back to readers.
//!
//! Features:
//! - Fixed-capacity mmap- or temp-file-backed blocks with producer→consumer
//!   readiness signalling and secure wipe on recycle
//! - Per-file block pools under a shared, injected memory budget, with one
//!   reserved slot per pool
//! - Keyed LRU cache with reference-counted pinning; pinned entries are
//!   never evicted
//! - Asynchronous download manager with at-most-one-in-flight-per-key
//!   semantics, priority queuing and bounded retries
//! - Prefetch blocks with progressive watermarks and zero-copy slice reads
//!   for streaming consumption

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod cache;
pub mod context;
pub mod download;
pub mod error;
pub mod pool;

// Re-export main types
pub use block::{
    Block, BlockReader, BlockState, DiskBlock, DiskBlockReader, MemoryBlock, PrefetchBlock,
    SliceRead, WaitOutcome,
};
pub use cache::{BlockCache, CacheConfig, CacheKey, CacheStats, CachedBlock, Lookup};
pub use context::CancelContext;
pub use download::{
    AsyncDownloadManager, BlockSource, CompletionCallback, DownloadRequest, DownloadStatus,
    DownloadTarget, DownloadTask, ReadStream, TaskState,
};
pub use error::{CacheError, Result, ResultExt};
pub use pool::{BlockPool, BlockType, MemoryBudget, PoolConfig};

/// Commonly used imports.
pub mod prelude {
    pub use crate::block::{Block, BlockState, MemoryBlock, PrefetchBlock, WaitOutcome};
    pub use crate::cache::{BlockCache, CacheConfig, CacheKey, CachedBlock, Lookup};
    pub use crate::context::CancelContext;
    pub use crate::download::{
        AsyncDownloadManager, BlockSource, DownloadRequest, DownloadTarget, ReadStream, TaskState,
    };
    pub use crate::error::{CacheError, Result};
    pub use crate::pool::{BlockPool, BlockType, MemoryBudget, PoolConfig};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_basic_block() {
        let block = MemoryBlock::new(1024).unwrap();
        block.write(b"hello").unwrap();
        block.notify_terminal(BlockState::Downloaded).unwrap();

        let mut buf = [0u8; 5];
        block.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_pool_round_trip() {
        let budget = Arc::new(MemoryBudget::new(4));
        let pool = BlockPool::new(
            PoolConfig {
                block_size: 1024,
                max_blocks: 4,
                block_type: BlockType::Memory,
            },
            budget,
        )
        .unwrap();

        let ctx = CancelContext::new();
        let mut blocks = Vec::new();
        for _ in 0..4 {
            blocks.push(pool.get(&ctx).unwrap());
        }
        for block in blocks {
            pool.release(block).unwrap();
        }
        assert_eq!(pool.total_blocks(), 4);
        assert_eq!(pool.free_len(), 4);
    }

    #[test]
    fn test_cache_hit_miss_cycle() {
        let cache = BlockCache::new(
            CacheConfig {
                block_size: 4096,
                max_blocks: 8,
                block_type: BlockType::Memory,
            },
            Arc::new(MemoryBudget::new(16)),
        )
        .unwrap();

        let key = CacheKey::from_object("bucket/obj", 3, 0, 4096);
        let entry = cache.get(&key).unwrap();
        entry.block().write(b"cached bytes").unwrap();

        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.block().size(), 12);

        cache.release(&entry);
        cache.release(&hit);
        assert_eq!(cache.stats().in_use, 0);
    }

    #[test]
    fn test_prefetch_watermark() {
        let block = PrefetchBlock::new(4096).unwrap();
        block.write(b"streaming").unwrap();
        block.notify_progress(9).unwrap();

        let ctx = CancelContext::new();
        assert_eq!(
            block.await_watermark(&ctx, 9).unwrap(),
            WaitOutcome::Watermark(9)
        );
        assert_eq!(block.read_at_slice(0, 9).unwrap().bytes, b"streaming");
    }
}
