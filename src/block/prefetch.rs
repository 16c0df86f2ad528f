// src/block/prefetch.rs
//! Prefetch blocks: progressive readiness plus zero-copy consumption.
//!
//! During a streaming download the producer appends and publishes a rising
//! bytes-available watermark; readers wait for just the bytes they need and
//! consume them as borrowed slices instead of copies.

use super::core::{Block, BlockReader};
use super::memory::MemoryBlock;
use super::ready::{BlockState, WaitOutcome};
use crate::context::CancelContext;
use crate::error::Result;
use std::sync::atomic::{AtomicI64, Ordering};

/// A borrowed view into a prefetch block's buffer.
///
/// `eof` is set when the requested length was truncated at the end of the
/// block's valid data. The view stays valid for as long as the borrow of
/// the block is held.
#[derive(Debug)]
pub struct SliceRead<'a> {
    /// The bytes, without copying.
    pub bytes: &'a [u8],
    /// Whether the read was truncated.
    pub eof: bool,
}

/// Memory-backed block with progressive readiness and explicit reference
/// counting for streaming reads.
///
/// # Examples
///
/// ```
/// use blockcache::{Block, CancelContext, PrefetchBlock, WaitOutcome};
///
/// let block = PrefetchBlock::new(1024)?;
/// block.write(b"streamed")?;
/// block.notify_progress(8)?;
///
/// let ctx = CancelContext::new();
/// assert_eq!(block.await_watermark(&ctx, 8)?, WaitOutcome::Watermark(8));
///
/// let view = block.read_at_slice(0, 8)?;
/// assert_eq!(view.bytes, b"streamed");
/// # Ok::<(), blockcache::CacheError>(())
/// ```
pub struct PrefetchBlock {
    inner: MemoryBlock,
    /// Consumer reference count; starts at 1 for the creator.
    refs: AtomicI64,
}

impl PrefetchBlock {
    /// Maps `capacity` bytes with a progressive readiness signal. The
    /// creator holds the initial reference.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: MemoryBlock::with_signal(capacity, true)?,
            refs: AtomicI64::new(1),
        })
    }

    /// Blocks until at least `requested_bytes` are readable, a terminal
    /// state arrives, or `ctx` is cancelled.
    pub fn await_watermark(&self, ctx: &CancelContext, requested_bytes: u64) -> Result<WaitOutcome> {
        self.inner.signal_ref().await_watermark(ctx, requested_bytes)
    }

    /// Borrows `[off, min(off + len, size))` without copying.
    pub fn read_at_slice(&self, off: usize, len: usize) -> Result<SliceRead<'_>> {
        let (bytes, eof) = self.inner.slice(off, len)?;
        Ok(SliceRead { bytes, eof })
    }

    /// Takes an additional reference.
    pub fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference; returns `true` when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the count goes negative; releasing more references than
    /// were taken is a programming error.
    pub fn dec_ref(&self) -> bool {
        let left = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(left >= 0, "prefetch block reference count went negative");
        left == 0
    }

    /// Current reference count.
    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }
}

impl Block for PrefetchBlock {
    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        self.inner.write(data)
    }

    fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        self.inner.read_at(buf, off)
    }

    fn reader(&self) -> BlockReader<'_> {
        BlockReader::new(self)
    }

    fn reuse(&self) -> Result<()> {
        self.inner.reuse()?;
        self.refs.store(1, Ordering::Release);
        Ok(())
    }

    fn set_abs_start_off(&self, off: u64) -> Result<()> {
        self.inner.set_abs_start_off(off)
    }

    fn abs_start_off(&self) -> u64 {
        self.inner.abs_start_off()
    }

    fn state(&self) -> BlockState {
        self.inner.state()
    }

    fn await_ready(&self, ctx: &CancelContext) -> Result<BlockState> {
        self.inner.await_ready(ctx)
    }

    fn notify_terminal(&self, state: BlockState) -> Result<()> {
        self.inner.notify_terminal(state)
    }

    fn notify_progress(&self, bytes_ready: u64) -> Result<()> {
        self.inner.notify_progress(bytes_ready)
    }

    fn supports_progress(&self) -> bool {
        true
    }

    fn deallocate(&self) -> Result<()> {
        self.inner.deallocate()
    }
}
