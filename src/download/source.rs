// src/download/source.rs
//! The remote range source consumed by the download manager.
//!
//! Implemented by the object-store client; the manager only ever sees byte
//! ranges. Errors must be pre-classified so the retry policy can tell a
//! connection reset from a missing object.

use crate::context::CancelContext;
use crate::error::Result;

/// Serves contiguous byte ranges of remote objects.
///
/// Errors are reported through [`CacheError`](crate::CacheError):
/// `Cancelled`, `ObjectNotFound`, `Transient` (retryable) or `Permanent`.
pub trait BlockSource: Send + Sync {
    /// Opens a stream over `[start, end)` of the named object generation.
    fn open_range(
        &self,
        object: &str,
        generation: i64,
        start: u64,
        end: u64,
        ctx: &CancelContext,
    ) -> Result<Box<dyn ReadStream>>;
}

/// A sequential stream of range bytes.
pub trait ReadStream: Send {
    /// Reads up to `buf.len()` bytes; `Ok(0)` signals the end of the range.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}
