// src/pool/block_pool.rs
//! Per-file block pool with a global-budget reservation.
//!
//! Every pool takes one permit from the shared [`MemoryBudget`] at creation
//! and keeps it until final teardown, so a pool can always produce at least
//! one block even when the process-wide budget is under pressure. Blocks
//! beyond the first cost an extra permit each.
//!
//! # Acquisition cascade
//!
//! 1. **Free list**: a previously released block, reset for reuse.
//! 2. **Fresh allocation** while under `max_blocks`; the first allocation
//!    rides the reservation, later ones take a budget permit non-blockingly.
//! 3. **Wait** until another user releases, honoring the caller's
//!    cancellation context.

use super::budget::MemoryBudget;
use super::config::{BlockType, PoolConfig};
use crate::block::{Block, DiskBlock, MemoryBlock};
use crate::context::CancelContext;
use crate::error::{CacheError, Result};
use crossbeam::channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How often a blocked `get` re-checks its cancellation context.
const CANCEL_POLL: Duration = Duration::from_millis(10);

struct PoolState {
    /// Blocks currently allocated (free or checked out).
    total: usize,
    /// Set once the reservation has been given back during teardown.
    reserved_released: bool,
}

/// Bounded allocator of uniform blocks for a single file.
///
/// Freed blocks are reset and recycled in preference to fresh allocations.
/// Safe for concurrent `get`/`release` from multiple threads.
pub struct BlockPool {
    config: PoolConfig,
    budget: Arc<MemoryBudget>,
    state: Mutex<PoolState>,
    free_tx: Sender<Arc<dyn Block>>,
    free_rx: Receiver<Arc<dyn Block>>,
}

impl BlockPool {
    /// Creates a pool and takes its reserved slot from `budget`.
    ///
    /// Fails with [`CacheError::CannotAllocate`] when the reservation cannot
    /// be taken, or [`CacheError::InvalidConfig`] for zero sizes.
    pub fn new(config: PoolConfig, budget: Arc<MemoryBudget>) -> Result<Self> {
        config.validate()?;
        if !budget.try_acquire() {
            return Err(CacheError::CannotAllocate);
        }
        let (free_tx, free_rx) = bounded(config.max_blocks);
        debug!(
            block_size = config.block_size,
            max_blocks = config.max_blocks,
            "block pool created"
        );
        Ok(Self {
            config,
            budget,
            state: Mutex::new(PoolState {
                total: 0,
                reserved_released: false,
            }),
            free_tx,
            free_rx,
        })
    }

    /// Configured capacity of each block.
    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Blocks currently allocated by this pool.
    pub fn total_blocks(&self) -> usize {
        self.state.lock().total
    }

    /// Blocks idle on the free list.
    pub fn free_len(&self) -> usize {
        self.free_rx.len()
    }

    fn alloc_block(&self) -> Result<Arc<dyn Block>> {
        Ok(match self.config.block_type {
            BlockType::Memory => Arc::new(MemoryBlock::new(self.config.block_size)?),
            BlockType::Disk => Arc::new(DiskBlock::new(self.config.block_size)?),
        })
    }

    /// Non-suspending acquisition: free list, then fresh allocation.
    ///
    /// `Ok(None)` means the pool is at capacity (or the budget refused a
    /// permit) and the caller must free something or wait.
    pub fn try_get(&self) -> Result<Option<Arc<dyn Block>>> {
        if let Ok(block) = self.free_rx.try_recv() {
            // Reset again on the way out: a cancelled producer may have
            // appended between release and now.
            block.reuse()?;
            return Ok(Some(block));
        }

        let needs_permit;
        {
            let mut state = self.state.lock();
            if state.total >= self.config.max_blocks {
                return Ok(None);
            }
            needs_permit = state.total >= 1 || state.reserved_released;
            if needs_permit && !self.budget.try_acquire() {
                return Ok(None);
            }
            state.total += 1;
        }

        match self.alloc_block() {
            Ok(block) => Ok(Some(block)),
            Err(e) => {
                self.state.lock().total -= 1;
                if needs_permit {
                    self.budget.release();
                }
                Err(e)
            }
        }
    }

    /// Returns a ready-to-use block, waiting for a release when the pool is
    /// exhausted. Cancellation of `ctx` aborts the wait.
    pub fn get(&self, ctx: &CancelContext) -> Result<Arc<dyn Block>> {
        loop {
            if let Some(block) = self.try_get()? {
                return Ok(block);
            }
            match self.free_rx.recv_timeout(CANCEL_POLL) {
                Ok(block) => {
                    block.reuse()?;
                    return Ok(block);
                }
                Err(_) => {
                    if ctx.is_cancelled() {
                        return Err(CacheError::Cancelled);
                    }
                }
            }
        }
    }

    /// Resets `block` and pushes it onto the free list.
    ///
    /// A full free list means more blocks were released than allocated; that
    /// is a detected invariant violation.
    pub fn release(&self, block: Arc<dyn Block>) -> Result<()> {
        block.reuse()?;
        self.free_tx.try_send(block).map_err(|_| {
            CacheError::ContractViolation("free list overflow: release without matching get".into())
        })
    }

    /// Drains the free list, deallocating every idle block and returning
    /// their budget permits.
    ///
    /// The pool's reserved permit is given back only when `release_last` is
    /// set and the drain empties the pool. Returns the number of blocks
    /// freed.
    pub fn clear_free(&self, release_last: bool) -> Result<usize> {
        let mut freed = 0;
        while let Ok(block) = self.free_rx.try_recv() {
            block.deallocate()?;
            let mut state = self.state.lock();
            state.total -= 1;
            if state.total >= 1 {
                self.budget.release();
            } else if release_last && !state.reserved_released {
                state.reserved_released = true;
                self.budget.release();
            }
            freed += 1;
        }
        if freed > 0 {
            debug!(freed, release_last, "pool free list drained");
        }
        Ok(freed)
    }
}

impl Drop for BlockPool {
    /// Returns every budget permit the pool still holds. Outstanding blocks
    /// are unmapped as their owners drop them.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut held = state.total.saturating_sub(1);
        if !state.reserved_released {
            held += 1;
        }
        for _ in 0..held {
            self.budget.release();
        }
    }
}
