// src/block/memory.rs
//! Memory-backed blocks over anonymous private mappings.

use super::core::{Block, BlockMeta, BlockReader};
use super::ready::{BlockState, ReadySignal};
use crate::context::CancelContext;
use crate::error::{CacheError, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use zeroize::Zeroize;

/// A block backed by a page-aligned anonymous memory mapping of exactly
/// `capacity` bytes.
///
/// The producer appends under the mapping lock and publishes the new size
/// with Release ordering; consumers load the size with Acquire and read
/// below it without taking any lock. The mapping address never changes, so
/// consumer reads and producer appends touch disjoint byte ranges.
///
/// The buffer is securely wiped on reuse and on drop.
pub struct MemoryBlock {
    /// Owns the mapping. Locked by the producer for appends and by
    /// `reuse`/`deallocate`; never locked on the consumer read path.
    map: Mutex<MmapMut>,
    /// Cached mapping address so readers stay lock-free. Stable for the
    /// lifetime of `map`.
    base: *mut u8,
    capacity: usize,
    /// Bytes published to consumers. Store-Release after a completed
    /// append, load-Acquire before a read.
    size: AtomicUsize,
    meta: BlockMeta,
    signal: ReadySignal,
}

// SAFETY: the raw `base` pointer aliases memory owned by `map`. Producers
// serialize on the `map` lock and write only at offsets >= the published
// size; consumers read only below the published size, which is released by
// the writer and acquired by the reader. No byte is ever written and read
// concurrently.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    /// Maps `capacity` bytes of zeroed anonymous memory.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_signal(capacity, false)
    }

    /// Progressive variant used by prefetch blocks.
    pub(crate) fn with_signal(capacity: usize, progressive: bool) -> Result<Self> {
        if capacity == 0 {
            return Err(CacheError::InvalidConfig("block capacity must be > 0".into()));
        }
        let mut map = MmapOptions::new()
            .len(capacity)
            .map_anon()
            .map_err(|e| CacheError::Io(format!("anonymous mapping failed: {}", e)))?;
        let base = map.as_mut_ptr();
        Ok(Self {
            map: Mutex::new(map),
            base,
            capacity,
            size: AtomicUsize::new(0),
            meta: BlockMeta::new(),
            signal: ReadySignal::new(progressive),
        })
    }

    pub(crate) fn signal_ref(&self) -> &ReadySignal {
        &self.signal
    }

    /// Borrow `[off, min(off + len, size))` without copying.
    ///
    /// Returns the slice and whether it was truncated at the end of the
    /// valid data. The returned borrow keeps the block alive, and appends
    /// never touch published bytes, so the view stays stable while held.
    pub(crate) fn slice(&self, off: usize, len: usize) -> Result<(&[u8], bool)> {
        let size = self.size.load(Ordering::Acquire);
        if off >= size {
            return Err(CacheError::OutOfBounds);
        }
        let wanted = off.saturating_add(len);
        let end = wanted.min(size);
        // SAFETY: [off, end) lies within [0, size); bytes below the
        // Acquire-loaded size are never written again until reuse, which
        // the caller's borrow of `self` excludes.
        let bytes = unsafe { std::slice::from_raw_parts(self.base.add(off), end - off) };
        Ok((bytes, end < wanted))
    }
}

impl Block for MemoryBlock {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let _guard = self.map.lock();
        if self.meta.is_deallocated() {
            return Err(CacheError::InvalidBuffer);
        }
        let size = self.size.load(Ordering::Relaxed);
        if size + data.len() > self.capacity {
            return Err(CacheError::Overflow);
        }
        if data.is_empty() {
            return Ok(0);
        }
        // SAFETY: bounds checked above; [size, size + len) is unpublished,
        // so no concurrent reader touches it.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(size), data.len());
        }
        self.size.store(size + data.len(), Ordering::Release);
        Ok(data.len())
    }

    fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        let size = self.size.load(Ordering::Acquire);
        if off >= size {
            return Err(CacheError::OutOfBounds);
        }
        let n = buf.len().min(size - off);
        // SAFETY: [off, off + n) lies within the published range.
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(off), buf.as_mut_ptr(), n);
        }
        Ok(n)
    }

    fn reader(&self) -> BlockReader<'_> {
        BlockReader::new(self)
    }

    fn reuse(&self) -> Result<()> {
        let mut map = self.map.lock();
        if self.meta.is_deallocated() {
            return Err(CacheError::InvalidBuffer);
        }
        let size = self.size.load(Ordering::Relaxed);
        map[..size].zeroize();
        self.size.store(0, Ordering::Release);
        self.meta.reset();
        self.signal.reset();
        Ok(())
    }

    fn set_abs_start_off(&self, off: u64) -> Result<()> {
        self.meta.set_abs_start_off(off)
    }

    fn abs_start_off(&self) -> u64 {
        self.meta.abs_start_off()
    }

    fn state(&self) -> BlockState {
        self.signal.current()
    }

    fn await_ready(&self, ctx: &CancelContext) -> Result<BlockState> {
        self.signal.await_terminal(ctx)
    }

    fn notify_terminal(&self, state: BlockState) -> Result<()> {
        self.signal.notify_terminal(state)
    }

    fn notify_progress(&self, bytes_ready: u64) -> Result<()> {
        self.signal.notify_progress(bytes_ready)
    }

    fn supports_progress(&self) -> bool {
        self.signal.progressive()
    }

    fn deallocate(&self) -> Result<()> {
        self.meta.mark_deallocated()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        let map = self.map.get_mut();
        let bytes: &mut [u8] = &mut map[..];
        bytes.zeroize();
    }
}
