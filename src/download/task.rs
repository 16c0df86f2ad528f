// src/download/task.rs
//! Download requests, task state and the task handle.

use crate::block::Block;
use crate::cache::CachedBlock;
use crate::cache::key::CacheKey;
use crate::context::CancelContext;
use crate::error::{CacheError, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Invoked exactly once when a task reaches a terminal state. Error detail
/// for failed downloads travels inside [`TaskState::Failed`].
pub type CompletionCallback = Box<dyn Fn(&CacheKey, &TaskState) + Send + Sync>;

/// Lifecycle of a download task. Terminal states are absorbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Registered but not yet picked up by a worker
    NotStarted,
    /// A worker is streaming the range
    InProgress,
    /// Range fully written and published
    Completed,
    /// Retries exhausted; carries the last error description
    Failed(String),
    /// Cancelled before completion
    Cancelled,
}

impl TaskState {
    /// Whether this state absorbs further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

/// Snapshot of a task's progress.
#[derive(Debug, Clone)]
pub struct DownloadStatus {
    /// Current lifecycle state
    pub state: TaskState,
    /// When a worker started streaming, if it has
    pub started_at: Option<Instant>,
}

/// Where a download writes its bytes.
pub enum DownloadTarget {
    /// A cache entry, pinned by the task until it reaches a terminal state
    Entry(Weak<CachedBlock>),
    /// A free-standing block owned by the caller
    Block(Arc<dyn Block>),
}

/// A request to download one byte range of a remote object.
///
/// With no explicit key, the canonical object key is synthesized at
/// scheduling time.
pub struct DownloadRequest {
    /// Cache key; `None` synthesizes the canonical form
    pub key: Option<CacheKey>,
    /// Remote object name
    pub object: String,
    /// Object generation
    pub generation: i64,
    /// First byte of the range (inclusive)
    pub start: u64,
    /// End of the range (exclusive)
    pub end: u64,
    /// Jump the normal queue
    pub priority: bool,
    /// Completion notification
    pub on_complete: Option<CompletionCallback>,
}

impl DownloadRequest {
    /// Request for `[start, end)` of an object generation.
    pub fn new(object: impl Into<String>, generation: i64, start: u64, end: u64) -> Self {
        Self {
            key: None,
            object: object.into(),
            generation,
            start,
            end,
            priority: false,
            on_complete: None,
        }
    }

    /// Uses an explicit cache key instead of the canonical one.
    pub fn with_key(mut self, key: CacheKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Places the request on the priority queue.
    pub fn high_priority(mut self) -> Self {
        self.priority = true;
        self
    }

    /// Registers a completion callback.
    pub fn on_complete(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    /// Rejects empty object names and degenerate ranges.
    pub fn validate(&self) -> Result<()> {
        if self.object.is_empty() {
            return Err(CacheError::InvalidConfig("object name must be non-empty".into()));
        }
        if self.start >= self.end {
            return Err(CacheError::InvalidConfig(format!(
                "invalid range: start {} must be < end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// The explicit key, or the canonical object key.
    pub fn effective_key(&self) -> CacheKey {
        self.key
            .clone()
            .unwrap_or_else(|| CacheKey::from_object(&self.object, self.generation, self.start, self.end))
    }
}

struct StatusInner {
    state: TaskState,
    started_at: Option<Instant>,
}

/// Handle to an in-flight (or terminal) download.
///
/// Two concurrent schedules of the same key share one task; the completion
/// callback fires exactly once, after the terminal state is observable
/// through [`status`](DownloadTask::status).
pub struct DownloadTask {
    key: CacheKey,
    pub(crate) object: String,
    pub(crate) generation: i64,
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) priority: bool,
    status: Mutex<StatusInner>,
    /// The task's own cancellation handle; independent of the scheduler's
    /// context.
    pub(crate) cancel: CancelContext,
    pub(crate) target: DownloadTarget,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl DownloadTask {
    pub(crate) fn new(key: CacheKey, request: DownloadRequest, target: DownloadTarget) -> Self {
        Self {
            key,
            object: request.object,
            generation: request.generation,
            start: request.start,
            end: request.end,
            priority: request.priority,
            status: Mutex::new(StatusInner {
                state: TaskState::NotStarted,
                started_at: None,
            }),
            cancel: CancelContext::new(),
            target,
            on_complete: Mutex::new(request.on_complete),
        }
    }

    /// The task's key.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.status.lock().state.clone()
    }

    /// Full status snapshot.
    pub fn status(&self) -> DownloadStatus {
        let inner = self.status.lock();
        DownloadStatus {
            state: inner.state.clone(),
            started_at: inner.started_at,
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.lock().state.is_terminal()
    }

    /// The destination block, if it is still reachable.
    pub(crate) fn dest_block(&self) -> Option<Arc<dyn Block>> {
        match &self.target {
            DownloadTarget::Entry(weak) => weak.upgrade().map(|e| Arc::clone(e.block())),
            DownloadTarget::Block(block) => Some(Arc::clone(block)),
        }
    }

    /// Marks the task running. Returns `false` when it is already terminal
    /// (cancelled while queued).
    pub(crate) fn mark_in_progress(&self) -> bool {
        let mut inner = self.status.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = TaskState::InProgress;
        inner.started_at = Some(Instant::now());
        true
    }

    /// Attempts the transition to `terminal`. The first caller wins, drops
    /// the task's pin on its cache entry and fires the completion callback
    /// with no locks held. Returns whether this call won.
    pub(crate) fn try_finish(&self, terminal: TaskState) -> bool {
        debug_assert!(terminal.is_terminal());
        {
            let mut inner = self.status.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = terminal.clone();
        }

        if let DownloadTarget::Entry(weak) = &self.target {
            if let Some(entry) = weak.upgrade() {
                entry.unpin();
            }
        }

        let callback = self.on_complete.lock().take();
        if let Some(callback) = callback {
            callback(&self.key, &terminal);
        }
        true
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
