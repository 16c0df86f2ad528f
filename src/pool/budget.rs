// src/pool/budget.rs
//! Process-wide memory budget shared by all block pools.

use crossbeam::channel::{Receiver, Sender, bounded};

/// Weighted semaphore bounding the total number of blocks allocated across
/// every pool in the process.
///
/// Implemented as a pre-filled bounded channel of unit permits: acquiring
/// pops a token, releasing pushes it back. The budget is always injected
/// into pools, never looked up from a global.
///
/// # Examples
///
/// ```
/// use blockcache::MemoryBudget;
///
/// let budget = MemoryBudget::new(2);
/// assert!(budget.try_acquire());
/// assert!(budget.try_acquire());
/// assert!(!budget.try_acquire());
///
/// budget.release();
/// assert_eq!(budget.available(), 1);
/// ```
pub struct MemoryBudget {
    permit_tx: Sender<()>,
    permit_rx: Receiver<()>,
    capacity: usize,
}

impl MemoryBudget {
    /// Creates a budget of `permits` block slots.
    ///
    /// A budget of zero admits no pools at all: every reservation attempt
    /// fails.
    pub fn new(permits: usize) -> Self {
        let (permit_tx, permit_rx) = bounded(permits);
        for _ in 0..permits {
            permit_tx.send(()).expect("filling a freshly created budget cannot fail");
        }
        Self {
            permit_tx,
            permit_rx,
            capacity: permits,
        }
    }

    /// Takes one permit without blocking; `false` when the budget is
    /// exhausted.
    pub fn try_acquire(&self) -> bool {
        self.permit_rx.try_recv().is_ok()
    }

    /// Returns one permit.
    pub fn release(&self) {
        let pushed = self.permit_tx.try_send(()).is_ok();
        debug_assert!(pushed, "budget released more permits than it holds");
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.permit_rx.len()
    }

    /// Total permits the budget was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
