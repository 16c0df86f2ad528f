// src/block/disk.rs
//! Disk-backed blocks over anonymous temp files.
//!
//! Same contract as [`MemoryBlock`](super::MemoryBlock), but the bytes live
//! in an unlinked temp file and all I/O is positional, so a `seek`-capable
//! reader is available on top of the plain sequential one.

use super::core::{Block, BlockMeta, BlockReader};
use super::ready::{BlockState, ReadySignal};
use crate::context::CancelContext;
use crate::error::{CacheError, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A block backed by an anonymous temp file of `capacity` bytes.
///
/// The file is unlinked at creation and reclaimed by the OS when the block
/// drops. Producer/consumer synchronization mirrors `MemoryBlock`: appends
/// serialize on a lock, the size is published Release and loaded Acquire,
/// and positional reads stay below it.
pub struct DiskBlock {
    file: File,
    capacity: usize,
    size: AtomicUsize,
    write_lock: Mutex<()>,
    meta: BlockMeta,
    signal: ReadySignal,
}

impl DiskBlock {
    /// Opens an unlinked temp file stretched to `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CacheError::InvalidConfig("block capacity must be > 0".into()));
        }
        let file = tempfile::tempfile()
            .map_err(|e| CacheError::Io(format!("temp file creation failed: {}", e)))?;
        file.set_len(capacity as u64)?;
        Ok(Self {
            file,
            capacity,
            size: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
            meta: BlockMeta::new(),
            signal: ReadySignal::new(false),
        })
    }

    /// A reader that also supports seeking, since disk blocks are
    /// file-offset addressed. Layers above the [`Block`] trait must not
    /// depend on this.
    pub fn seek_reader(&self) -> DiskBlockReader<'_> {
        DiskBlockReader { block: self, pos: 0 }
    }
}

impl Block for DiskBlock {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let _guard = self.write_lock.lock();
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
        self.file.write_all_at(data, size as u64)?;
        self.size.store(size + data.len(), Ordering::Release);
        Ok(data.len())
    }

    fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        let size = self.size.load(Ordering::Acquire);
        if off >= size {
            return Err(CacheError::OutOfBounds);
        }
        let n = buf.len().min(size - off);
        self.file.read_exact_at(&mut buf[..n], off as u64)?;
        Ok(n)
    }

    fn reader(&self) -> BlockReader<'_> {
        BlockReader::new(self)
    }

    fn reuse(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.meta.is_deallocated() {
            return Err(CacheError::InvalidBuffer);
        }
        // Drop old content, then stretch back to capacity.
        self.file.set_len(0)?;
        self.file.set_len(self.capacity as u64)?;
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

    fn deallocate(&self) -> Result<()> {
        self.meta.mark_deallocated()
    }
}

/// Seekable sequential reader over a disk block's valid bytes.
pub struct DiskBlockReader<'a> {
    block: &'a DiskBlock,
    pos: u64,
}

impl Read for DiskBlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let size = self.block.size() as u64;
        if buf.is_empty() || self.pos >= size {
            return Ok(0);
        }
        let n = self
            .block
            .read_at(buf, self.pos as usize)
            .map_err(std::io::Error::from)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for DiskBlockReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let size = self.block.size() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => size + d,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of block",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_write_read_round_trip() {
        let block = DiskBlock::new(64).unwrap();
        block.write(b"on disk").unwrap();

        let mut buf = [0u8; 7];
        assert_eq!(block.read_at(&mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"on disk");
    }

    #[test]
    fn test_overflow_and_bounds() {
        let block = DiskBlock::new(4).unwrap();
        assert_eq!(block.write(b"12345"), Err(CacheError::Overflow));
        block.write(b"1234").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(block.read_at(&mut buf, 4), Err(CacheError::OutOfBounds));
    }

    #[test]
    fn test_reuse_clears_content() {
        let block = DiskBlock::new(16).unwrap();
        block.write(b"old").unwrap();
        block.reuse().unwrap();
        assert_eq!(block.size(), 0);

        block.write(b"new").unwrap();
        let mut buf = [0u8; 3];
        block.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"new");
    }

    #[test]
    fn test_seek_reader() {
        let block = DiskBlock::new(32).unwrap();
        block.write(b"0123456789").unwrap();

        let mut reader = block.seek_reader();
        reader.seek(SeekFrom::Start(4)).unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "456789");

        reader.seek(SeekFrom::End(-2)).unwrap();
        let mut tail = String::new();
        reader.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "89");
    }

    #[test]
    fn test_readiness_same_contract_as_memory() {
        let block = DiskBlock::new(8).unwrap();
        block.notify_terminal(BlockState::Downloaded).unwrap();
        assert!(block.notify_terminal(BlockState::Cancelled).is_err());
        assert_eq!(
            block.await_ready(&CancelContext::new()).unwrap(),
            BlockState::Downloaded
        );
    }
}
