// src/block/core.rs
//! The block contract shared by memory- and disk-backed buffers.
//!
//! A block is a fixed-capacity byte buffer holding a contiguous range of a
//! remote object. One producer appends bytes and publishes readiness; any
//! number of consumers read below the published size. The producer's writes
//! happen-before a consumer's reads once the consumer has observed readiness
//! (or a watermark covering the bytes it touches).

use super::ready::BlockState;
use crate::context::CancelContext;
use crate::error::{CacheError, Result};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};

/// Fixed-capacity buffer with write-once readiness signalling.
///
/// Object-safe so pools and the cache can mix backing variants behind
/// `Arc<dyn Block>`.
pub trait Block: Send + Sync {
    /// Immutable capacity in bytes, set at creation.
    fn capacity(&self) -> usize;

    /// Bytes of valid data written so far. Monotonically non-decreasing
    /// until [`reuse`](Block::reuse).
    fn size(&self) -> usize;

    /// Appends `data` at the tail and returns the number of bytes written.
    ///
    /// Fails with [`CacheError::Overflow`] when the block cannot hold all of
    /// `data`; the block is unchanged in that case. Zero-length writes are
    /// no-ops returning `Ok(0)`.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Copies up to `buf.len()` bytes starting at block-relative `off`.
    ///
    /// Returns the number of bytes copied; a short count means the end of
    /// the valid data was reached. `off >= size` fails with
    /// [`CacheError::OutOfBounds`].
    fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize>;

    /// A one-shot sequential reader over `[0, size)`.
    fn reader(&self) -> BlockReader<'_>;

    /// Resets logical state for pool reuse: size, absolute offset and
    /// readiness all return to their initial values.
    ///
    /// Must only be called when no other party holds a reference to the
    /// block's data.
    fn reuse(&self) -> Result<()>;

    /// Records the absolute offset of this block's first byte within the
    /// source object. Settable exactly once per use; the second call fails
    /// with [`CacheError::AlreadySet`].
    fn set_abs_start_off(&self, off: u64) -> Result<()>;

    /// The absolute start offset.
    ///
    /// # Panics
    ///
    /// Panics when the offset has not been set; reading it unset is a
    /// programming error.
    fn abs_start_off(&self) -> u64;

    /// Last published state without blocking.
    fn state(&self) -> BlockState;

    /// Blocks until a terminal state is signalled or `ctx` is cancelled.
    ///
    /// After a terminal state has been observed once, subsequent calls
    /// return it immediately. Cancellation yields
    /// [`CacheError::NotReady`] carrying the last observed state.
    fn await_ready(&self, ctx: &CancelContext) -> Result<BlockState>;

    /// Producer publishes the terminal state. At most one terminal per use;
    /// a second call is a detected contract violation.
    fn notify_terminal(&self, state: BlockState) -> Result<()>;

    /// Producer publishes a progress watermark (progressive blocks only).
    fn notify_progress(&self, bytes_ready: u64) -> Result<()>;

    /// Whether this block accepts progress watermarks.
    fn supports_progress(&self) -> bool {
        false
    }

    /// Marks the backing storage released. The second call fails with
    /// [`CacheError::InvalidBuffer`]. The physical mapping or file is torn
    /// down when the last owner drops, so outstanding readers can never
    /// observe a dangling buffer.
    fn deallocate(&self) -> Result<()>;
}

/// Bookkeeping shared by every block variant: the absolute-offset tag and
/// the deallocation latch.
pub(crate) struct BlockMeta {
    abs_start_off: Mutex<Option<u64>>,
    deallocated: AtomicBool,
}

impl BlockMeta {
    pub(crate) fn new() -> Self {
        Self {
            abs_start_off: Mutex::new(None),
            deallocated: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_abs_start_off(&self, off: u64) -> Result<()> {
        let mut slot = self.abs_start_off.lock();
        if slot.is_some() {
            return Err(CacheError::AlreadySet);
        }
        *slot = Some(off);
        Ok(())
    }

    pub(crate) fn abs_start_off(&self) -> u64 {
        self.abs_start_off
            .lock()
            .expect("absolute start offset read before being set")
    }

    pub(crate) fn is_deallocated(&self) -> bool {
        self.deallocated.load(Ordering::Acquire)
    }

    /// Latches the deallocated flag. Errors on the second call.
    pub(crate) fn mark_deallocated(&self) -> Result<()> {
        if self.deallocated.swap(true, Ordering::AcqRel) {
            return Err(CacheError::InvalidBuffer);
        }
        Ok(())
    }

    /// Clears the per-use state (the deallocation latch survives reuse).
    pub(crate) fn reset(&self) {
        *self.abs_start_off.lock() = None;
    }
}

/// Sequential [`Read`] view over a block's valid bytes.
///
/// Reads stop at the block's size as published when each `read` call runs;
/// a block still downloading yields what is visible so far.
pub struct BlockReader<'a> {
    block: &'a dyn Block,
    pos: usize,
}

impl<'a> BlockReader<'a> {
    pub(crate) fn new(block: &'a dyn Block) -> Self {
        Self { block, pos: 0 }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl Read for BlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || self.pos >= self.block.size() {
            return Ok(0);
        }
        let n = self.block.read_at(buf, self.pos).map_err(std::io::Error::from)?;
        self.pos += n;
        Ok(n)
    }
}
