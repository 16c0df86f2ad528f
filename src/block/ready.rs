// src/block/ready.rs
//! Producer→consumer readiness signalling.
//!
//! A block's producer publishes progress and exactly one terminal state; any
//! number of consumers wait for either. The signal is a mutex-protected state
//! plus a condvar rather than a channel so that fan-out (many waiters, one
//! notification) falls out naturally and terminal states stay observable after
//! the first wait returns.
//!
//! Memory ordering: a consumer returning from a wait has synchronized with the
//! producer's notification through the mutex, so buffer bytes written before
//! `notify_*` are visible after the wait.

use crate::context::CancelContext;
use crate::error::{CacheError, Result};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// How often waiters re-check their cancellation context.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Download state of a block's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    /// Producer still writing; non-terminal
    InProgress,
    /// All bytes present and safe to read
    Downloaded,
    /// Download gave up; carries the final error description
    Failed(String),
    /// Download was cancelled; bytes already written are undefined data
    Cancelled,
}

impl BlockState {
    /// Terminal states absorb all further notifications and waits.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Outcome of a watermark wait on a progressive block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The requested watermark was reached; download still in progress
    Watermark(u64),
    /// A terminal state arrived before (or at) the watermark
    Terminal(BlockState),
}

struct SignalState {
    terminal: Option<BlockState>,
    bytes_ready: u64,
}

pub(crate) struct ReadySignal {
    /// Progressive signals accept watermark notifications; plain signals
    /// accept only the single terminal.
    progressive: bool,
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl ReadySignal {
    pub(crate) fn new(progressive: bool) -> Self {
        Self {
            progressive,
            state: Mutex::new(SignalState {
                terminal: None,
                bytes_ready: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn progressive(&self) -> bool {
        self.progressive
    }

    /// Publishes the terminal state. At most one terminal per use.
    pub(crate) fn notify_terminal(&self, terminal: BlockState) -> Result<()> {
        if !terminal.is_terminal() {
            return Err(CacheError::ContractViolation(
                "notify_terminal called with a non-terminal state".into(),
            ));
        }
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return Err(CacheError::ContractViolation(
                "block already reached a terminal state".into(),
            ));
        }
        state.terminal = Some(terminal);
        self.cond.notify_all();
        Ok(())
    }

    /// Publishes a non-decreasing progress watermark. Progressive blocks only.
    pub(crate) fn notify_progress(&self, bytes_ready: u64) -> Result<()> {
        if !self.progressive {
            return Err(CacheError::ContractViolation(
                "progress notification on a terminal-only block".into(),
            ));
        }
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return Err(CacheError::ContractViolation(
                "progress notification after terminal state".into(),
            ));
        }
        if bytes_ready < state.bytes_ready {
            return Err(CacheError::ContractViolation(format!(
                "watermark regressed: {} < {}",
                bytes_ready, state.bytes_ready
            )));
        }
        state.bytes_ready = bytes_ready;
        self.cond.notify_all();
        Ok(())
    }

    /// Blocks until a terminal state is published or `ctx` is cancelled.
    ///
    /// Once terminal, returns immediately on every subsequent call.
    pub(crate) fn await_terminal(&self, ctx: &CancelContext) -> Result<BlockState> {
        let mut state = self.state.lock();
        loop {
            if let Some(terminal) = &state.terminal {
                return Ok(terminal.clone());
            }
            if ctx.is_cancelled() {
                return Err(CacheError::NotReady {
                    last: BlockState::InProgress,
                });
            }
            let _ = self.cond.wait_for(&mut state, CANCEL_POLL);
        }
    }

    /// Blocks until `bytes_ready >= requested`, a terminal state arrives, or
    /// `ctx` is cancelled.
    pub(crate) fn await_watermark(
        &self,
        ctx: &CancelContext,
        requested: u64,
    ) -> Result<WaitOutcome> {
        let mut state = self.state.lock();
        loop {
            if let Some(terminal) = &state.terminal {
                return Ok(WaitOutcome::Terminal(terminal.clone()));
            }
            if state.bytes_ready >= requested {
                return Ok(WaitOutcome::Watermark(state.bytes_ready));
            }
            if ctx.is_cancelled() {
                return Err(CacheError::NotReady {
                    last: BlockState::InProgress,
                });
            }
            let _ = self.cond.wait_for(&mut state, CANCEL_POLL);
        }
    }

    /// Last published state without blocking.
    pub(crate) fn current(&self) -> BlockState {
        self.state
            .lock()
            .terminal
            .clone()
            .unwrap_or(BlockState::InProgress)
    }

    /// Resets for pool reuse. Only valid when no waiters remain.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.terminal = None;
        state.bytes_ready = 0;
    }
}
