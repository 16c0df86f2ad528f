// src/download/manager.rs
//! Asynchronous download manager: a key→task index over a bounded worker
//! pool.
//!
//! Scheduling is idempotent per key: concurrent schedules of the same key
//! yield handles to one task, and its completion callback fires exactly
//! once. Workers drain a priority queue ahead of the normal one and stream
//! ranges from the [`BlockSource`] into each task's destination block,
//! publishing watermarks on progressive blocks and exactly one terminal
//! state.

use super::source::BlockSource;
use super::task::{DownloadRequest, DownloadStatus, DownloadTarget, DownloadTask, TaskState};
use crate::block::{Block, BlockState};
use crate::cache::CacheKey;
use crate::context::CancelContext;
use crate::error::{CacheError, Result};
use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Bytes pulled from the source per read.
const READ_CHUNK: usize = 128 * 1024;

struct Queues {
    high_tx: Sender<Arc<DownloadTask>>,
    norm_tx: Sender<Arc<DownloadTask>>,
}

/// Schedules and tracks range downloads.
///
/// At most one active task exists per key; terminal tasks are retained for
/// status queries until [`cleanup_completed`](Self::cleanup_completed)
/// removes them or a new schedule replaces them.
pub struct AsyncDownloadManager {
    source: Arc<dyn BlockSource>,
    max_retries: usize,
    tasks: Mutex<HashMap<CacheKey, Arc<DownloadTask>>>,
    queues: Mutex<Option<Queues>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl AsyncDownloadManager {
    /// Spawns `workers` download threads over `source`.
    ///
    /// `max_retries` bounds re-attempts after transient source errors;
    /// zero means a single attempt.
    pub fn new(source: Arc<dyn BlockSource>, workers: usize, max_retries: usize) -> Result<Self> {
        if workers == 0 {
            return Err(CacheError::InvalidConfig("worker count must be > 0".into()));
        }
        let (high_tx, high_rx) = unbounded::<Arc<DownloadTask>>();
        let (norm_tx, norm_rx) = unbounded::<Arc<DownloadTask>>();

        let handles = (0..workers)
            .map(|i| {
                let high_rx = high_rx.clone();
                let norm_rx = norm_rx.clone();
                let source = Arc::clone(&source);
                std::thread::Builder::new()
                    .name(format!("blockcache-dl-{}", i))
                    .spawn(move || worker_loop(&high_rx, &norm_rx, source.as_ref(), max_retries))
                    .map_err(|e| CacheError::Io(format!("worker spawn failed: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source,
            max_retries,
            tasks: Mutex::new(HashMap::new()),
            queues: Mutex::new(Some(Queues { high_tx, norm_tx })),
            workers: Mutex::new(handles),
            accepting: AtomicBool::new(true),
        })
    }

    /// Registers and submits a download, or returns the active task already
    /// registered under the same key.
    ///
    /// A `ctx` that is already cancelled still produces a task; it reaches
    /// `Cancelled` (and fires its callback) without touching the source.
    pub fn schedule(
        &self,
        ctx: &CancelContext,
        request: DownloadRequest,
        target: DownloadTarget,
    ) -> Result<Arc<DownloadTask>> {
        self.schedule_inner(ctx, request, target).map(|(task, _)| task)
    }

    /// As [`schedule`](Self::schedule), also reporting whether a new task
    /// was created.
    pub(crate) fn schedule_inner(
        &self,
        ctx: &CancelContext,
        request: DownloadRequest,
        target: DownloadTarget,
    ) -> Result<(Arc<DownloadTask>, bool)> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CacheError::Cancelled);
        }
        request.validate()?;
        let key = request.effective_key();

        let task = {
            let mut tasks = self.tasks.lock();
            if let Some(existing) = tasks.get(&key) {
                if !existing.is_terminal() {
                    return Ok((Arc::clone(existing), false));
                }
            }
            let task = Arc::new(DownloadTask::new(key.clone(), request, target));
            if ctx.is_cancelled() {
                task.cancel.cancel();
            }
            tasks.insert(key.clone(), Arc::clone(&task));
            task
        };

        // Tag the destination with its position in the object.
        if let Some(block) = task.dest_block() {
            let _ = block.set_abs_start_off(task.start);
        }

        let submitted = {
            let queues = self.queues.lock();
            match queues.as_ref() {
                Some(queues) => {
                    let tx = if task.priority { &queues.high_tx } else { &queues.norm_tx };
                    tx.send(Arc::clone(&task)).is_ok()
                }
                None => false,
            }
        };
        if !submitted {
            // Shutdown raced the registration; withdraw the task so the
            // caller's pin stays untouched on the error path.
            self.tasks.lock().remove(&key);
            return Err(CacheError::Cancelled);
        }

        debug!(key = %key, priority = task.priority, "download scheduled");
        Ok((task, true))
    }

    /// Status of the task registered under `key`, if any.
    pub fn get_status(&self, key: &CacheKey) -> Option<DownloadStatus> {
        self.tasks.lock().get(key).map(|t| t.status())
    }

    /// Cancels the task under `key`. Missing keys and terminal tasks are
    /// no-ops.
    pub fn cancel(&self, key: &CacheKey) {
        let task = self.tasks.lock().get(key).cloned();
        if let Some(task) = task {
            cancel_task(&task);
        }
    }

    /// Keys of all non-terminal tasks.
    pub fn list_active(&self) -> Vec<CacheKey> {
        self.tasks
            .lock()
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.key().clone())
            .collect()
    }

    /// Drops terminal tasks from the index; returns how many were removed.
    pub fn cleanup_completed(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, t| !t.is_terminal());
        before - tasks.len()
    }

    /// Cancels every active task, drains the workers and rejects further
    /// schedules. Idempotent.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        let tasks: Vec<_> = self.tasks.lock().values().cloned().collect();
        for task in &tasks {
            cancel_task(task);
        }

        // Dropping the senders lets workers finish the queue and exit.
        *self.queues.lock() = None;
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
        debug!("download manager shut down");
    }

    /// The source this manager streams from.
    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.source
    }

    /// Configured retry budget for transient errors.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }
}

impl Drop for AsyncDownloadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cancels a task: signals its handle and, if the cancel wins the terminal
/// race, publishes `Cancelled` on the destination block.
fn cancel_task(task: &DownloadTask) {
    task.cancel.cancel();
    if task.try_finish(TaskState::Cancelled) {
        if let Some(block) = task.dest_block() {
            let _ = block.notify_terminal(BlockState::Cancelled);
        }
        debug!(key = %task.key(), "download cancelled");
    }
}

fn worker_loop(
    high_rx: &Receiver<Arc<DownloadTask>>,
    norm_rx: &Receiver<Arc<DownloadTask>>,
    source: &dyn BlockSource,
    max_retries: usize,
) {
    loop {
        // Priority tasks jump the queue.
        let task = match high_rx.try_recv() {
            Ok(task) => Some(task),
            Err(_) => crossbeam::select! {
                recv(high_rx) -> msg => msg.ok(),
                recv(norm_rx) -> msg => msg.ok(),
            },
        };

        match task {
            Some(task) => run_task(&task, source, max_retries),
            None => {
                // Senders dropped: drain what is still queued, then exit.
                while let Ok(task) = high_rx.try_recv() {
                    run_task(&task, source, max_retries);
                }
                while let Ok(task) = norm_rx.try_recv() {
                    run_task(&task, source, max_retries);
                }
                return;
            }
        }
    }
}

fn run_task(task: &DownloadTask, source: &dyn BlockSource, max_retries: usize) {
    if task.is_terminal() {
        // Cancelled while queued; whoever cancelled published the block state.
        return;
    }
    let Some(block) = task.dest_block() else {
        task.try_finish(TaskState::Cancelled);
        return;
    };
    if !task.mark_in_progress() {
        return;
    }

    let mut attempt = 0;
    loop {
        match stream_range(task, block.as_ref(), source) {
            Ok(()) => {
                if task.try_finish(TaskState::Completed) {
                    let _ = block.notify_terminal(BlockState::Downloaded);
                    debug!(key = %task.key(), bytes = block.size(), "download completed");
                }
                return;
            }
            Err(CacheError::Cancelled) => {
                if task.try_finish(TaskState::Cancelled) {
                    let _ = block.notify_terminal(BlockState::Cancelled);
                    debug!(key = %task.key(), "download cancelled");
                }
                return;
            }
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                warn!(key = %task.key(), attempt, error = %e, "transient download error, retrying");
                // Restart from a clean block.
                let _ = block.reuse();
                let _ = block.set_abs_start_off(task.start);
            }
            Err(e) => {
                let detail = e.to_string();
                if task.try_finish(TaskState::Failed(detail.clone())) {
                    let _ = block.notify_terminal(BlockState::Failed(detail));
                    warn!(key = %task.key(), error = %e, "download failed");
                }
                return;
            }
        }
    }
}

/// Streams `[start, end)` into `block`, publishing watermarks on
/// progressive blocks. Checks the task's cancellation handle between
/// chunks.
fn stream_range(task: &DownloadTask, block: &dyn Block, source: &dyn BlockSource) -> Result<()> {
    if task.cancel.is_cancelled() {
        return Err(CacheError::Cancelled);
    }
    let mut stream = source.open_range(
        &task.object,
        task.generation,
        task.start,
        task.end,
        &task.cancel,
    )?;

    let mut chunk = vec![0u8; READ_CHUNK.min(block.capacity())];
    loop {
        if task.cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        block.write(&chunk[..n])?;
        if block.supports_progress() {
            let _ = block.notify_progress(block.size() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlock;
    use crate::download::source::ReadStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// In-memory source: serves a repeating pattern, optionally failing the
    /// first N opens with a transient error and pacing each chunk.
    struct StubSource {
        transient_failures: AtomicUsize,
        chunk_delay: Duration,
        missing: bool,
    }

    impl StubSource {
        fn ok() -> Self {
            Self {
                transient_failures: AtomicUsize::new(0),
                chunk_delay: Duration::ZERO,
                missing: false,
            }
        }

        fn flaky(failures: usize) -> Self {
            Self {
                transient_failures: AtomicUsize::new(failures),
                ..Self::ok()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                chunk_delay: delay,
                ..Self::ok()
            }
        }
    }

    struct StubStream {
        remaining: u64,
        delay: Duration,
    }

    impl ReadStream for StubStream {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            // Cap chunks so slow streams yield often.
            let n = (self.remaining.min(buf.len() as u64) as usize).min(16 * 1024);
            buf[..n].fill(0xC7);
            self.remaining -= n as u64;
            Ok(n)
        }
    }

    impl BlockSource for StubSource {
        fn open_range(
            &self,
            _object: &str,
            _generation: i64,
            start: u64,
            end: u64,
            _ctx: &CancelContext,
        ) -> Result<Box<dyn ReadStream>> {
            if self.missing {
                return Err(CacheError::ObjectNotFound);
            }
            let left = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if left.is_ok() {
                return Err(CacheError::Transient("connection reset".into()));
            }
            Ok(Box::new(StubStream {
                remaining: end - start,
                delay: self.chunk_delay,
            }))
        }
    }

    fn target_block(capacity: usize) -> (Arc<dyn Block>, DownloadTarget) {
        let block: Arc<dyn Block> = Arc::new(MemoryBlock::new(capacity).unwrap());
        (Arc::clone(&block), DownloadTarget::Block(block))
    }

    fn wait_terminal(task: &DownloadTask) -> TaskState {
        for _ in 0..500 {
            if task.is_terminal() {
                return task.state();
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("task never reached a terminal state");
    }

    #[test]
    fn test_download_fills_block() {
        let manager = AsyncDownloadManager::new(Arc::new(StubSource::ok()), 2, 0).unwrap();
        let (block, target) = target_block(64 * 1024);

        let task = manager
            .schedule(
                &CancelContext::new(),
                DownloadRequest::new("obj", 1, 0, 4096),
                target,
            )
            .unwrap();

        assert_eq!(wait_terminal(&task), TaskState::Completed);
        assert_eq!(block.size(), 4096);
        assert_eq!(block.abs_start_off(), 0);
        assert_eq!(
            block.await_ready(&CancelContext::new()).unwrap(),
            BlockState::Downloaded
        );
    }

    #[test]
    fn test_schedule_is_idempotent_per_key() {
        let manager =
            AsyncDownloadManager::new(Arc::new(StubSource::slow(Duration::from_millis(5))), 1, 0)
                .unwrap();
        let (_, target_a) = target_block(1024 * 1024);
        let (_, target_b) = target_block(1024 * 1024);

        let ctx = CancelContext::new();
        let a = manager
            .schedule(&ctx, DownloadRequest::new("obj", 1, 0, 512 * 1024), target_a)
            .unwrap();
        let b = manager
            .schedule(&ctx, DownloadRequest::new("obj", 1, 0, 512 * 1024), target_b)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        manager.cancel(a.key());
    }

    #[test]
    fn test_cancelled_context_yields_cancelled_task_and_one_callback() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        let manager = AsyncDownloadManager::new(Arc::new(StubSource::ok()), 1, 0).unwrap();
        let (block, target) = target_block(4096);

        let request = DownloadRequest::new("obj", 1, 0, 1024).on_complete(Box::new(|_, state| {
            assert_eq!(state, &TaskState::Cancelled);
            FIRED.fetch_add(1, Ordering::SeqCst);
        }));

        let task = manager
            .schedule(&CancelContext::cancelled(), request, target)
            .unwrap();

        assert_eq!(wait_terminal(&task), TaskState::Cancelled);
        assert_eq!(
            block.await_ready(&CancelContext::new()).unwrap(),
            BlockState::Cancelled
        );
        // Give a racing duplicate callback a chance to fire, then check.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_mid_download() {
        let manager =
            AsyncDownloadManager::new(Arc::new(StubSource::slow(Duration::from_millis(10))), 1, 0)
                .unwrap();
        let (block, target) = target_block(4 * 1024 * 1024);

        let task = manager
            .schedule(
                &CancelContext::new(),
                DownloadRequest::new("obj", 1, 0, 4 * 1024 * 1024),
                target,
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(25));
        manager.cancel(task.key());

        assert_eq!(wait_terminal(&task), TaskState::Cancelled);
        assert_eq!(block.state(), BlockState::Cancelled);
        // Cancelling again is a no-op.
        manager.cancel(task.key());
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_transient_errors_retry_up_to_budget() {
        let manager = AsyncDownloadManager::new(Arc::new(StubSource::flaky(2)), 1, 2).unwrap();
        let (block, target) = target_block(8192);

        let task = manager
            .schedule(
                &CancelContext::new(),
                DownloadRequest::new("obj", 1, 0, 2048),
                target,
            )
            .unwrap();

        assert_eq!(wait_terminal(&task), TaskState::Completed);
        assert_eq!(block.size(), 2048);
    }

    #[test]
    fn test_exhausted_retries_fail_with_last_error() {
        let manager = AsyncDownloadManager::new(Arc::new(StubSource::flaky(3)), 1, 1).unwrap();
        let (block, target) = target_block(8192);

        let task = manager
            .schedule(
                &CancelContext::new(),
                DownloadRequest::new("obj", 1, 0, 2048),
                target,
            )
            .unwrap();

        match wait_terminal(&task) {
            TaskState::Failed(detail) => assert!(detail.contains("connection reset")),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(matches!(block.state(), BlockState::Failed(_)));
    }

    #[test]
    fn test_missing_object_fails_without_retry() {
        let source = Arc::new(StubSource {
            missing: true,
            ..StubSource::ok()
        });
        let manager = AsyncDownloadManager::new(source, 1, 5).unwrap();
        let (_, target) = target_block(4096);

        let task = manager
            .schedule(
                &CancelContext::new(),
                DownloadRequest::new("obj", 1, 0, 1024),
                target,
            )
            .unwrap();

        assert!(matches!(wait_terminal(&task), TaskState::Failed(_)));
    }

    #[test]
    fn test_list_active_and_cleanup() {
        let manager = AsyncDownloadManager::new(Arc::new(StubSource::ok()), 2, 0).unwrap();
        let (_, target) = target_block(4096);

        let task = manager
            .schedule(
                &CancelContext::new(),
                DownloadRequest::new("obj", 1, 0, 1024),
                target,
            )
            .unwrap();
        wait_terminal(&task);

        assert!(manager.list_active().is_empty());
        assert_eq!(manager.cleanup_completed(), 1);
        assert!(manager.get_status(task.key()).is_none());
    }

    #[test]
    fn test_shutdown_rejects_further_schedules() {
        let manager = AsyncDownloadManager::new(Arc::new(StubSource::ok()), 1, 0).unwrap();
        manager.shutdown();

        let (_, target) = target_block(4096);
        assert_eq!(
            manager
                .schedule(
                    &CancelContext::new(),
                    DownloadRequest::new("obj", 1, 0, 1024),
                    target,
                )
                .unwrap_err(),
            CacheError::Cancelled
        );
        // Idempotent.
        manager.shutdown();
    }

    #[test]
    fn test_invalid_requests_rejected() {
        let manager = AsyncDownloadManager::new(Arc::new(StubSource::ok()), 1, 0).unwrap();
        let (_, target) = target_block(4096);
        assert!(matches!(
            manager.schedule(
                &CancelContext::new(),
                DownloadRequest::new("obj", 1, 9, 9),
                target,
            ),
            Err(CacheError::InvalidConfig(_))
        ));
    }
}
