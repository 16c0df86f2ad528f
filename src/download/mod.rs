// src/download/mod.rs
//! Asynchronous range downloads.

pub(crate) mod manager;
pub(crate) mod source;
pub(crate) mod task;

pub use manager::AsyncDownloadManager;
pub use source::{BlockSource, ReadStream};
pub use task::{
    CompletionCallback, DownloadRequest, DownloadStatus, DownloadTarget, DownloadTask, TaskState,
};
