// src/context.rs
//! Cancellation contexts for suspending operations.
//!
//! Every operation that can block (`Block::await_ready`, `BlockPool::get`,
//! download execution) takes a [`CancelContext`]. Cancellation is cooperative:
//! waiters poll the flag between condvar wakeups and workers check it between
//! stream chunks, so no registration with the waiting side is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cloneable cancellation token.
///
/// Cloning shares the underlying flag; cancelling any clone cancels them all.
///
/// # Examples
///
/// ```
/// use blockcache::CancelContext;
///
/// let ctx = CancelContext::new();
/// let worker_ctx = ctx.clone();
/// assert!(!worker_ctx.is_cancelled());
///
/// ctx.cancel();
/// assert!(worker_ctx.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelContext {
    cancelled: Arc<AtomicBool>,
}

impl CancelContext {
    /// Creates a context that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that is already cancelled.
    ///
    /// Useful for tests and for rejecting work during shutdown.
    pub fn cancelled() -> Self {
        let ctx = Self::new();
        ctx.cancel();
        ctx
    }

    /// Signals cancellation to every clone of this context.
    ///
    /// Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been signalled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_not_cancelled() {
        assert!(!CancelContext::new().is_cancelled());
    }

    #[test]
    fn test_cancel_is_shared_and_idempotent() {
        let ctx = CancelContext::new();
        let clone = ctx.clone();
        ctx.cancel();
        ctx.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_pre_cancelled() {
        assert!(CancelContext::cancelled().is_cancelled());
    }
}
