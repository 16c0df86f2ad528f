// src/error.rs
//! Error types for cache, pool and download operations.

use crate::block::BlockState;
use std::fmt;

/// Errors produced by blocks, pools, the cache and the download manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Configuration violates invariants (zero sizes, empty identifiers)
    InvalidConfig(String),
    /// Write would exceed the block's fixed capacity; block state unchanged
    Overflow,
    /// Read offset outside `[0, size)`
    OutOfBounds,
    /// Await was cancelled by its context; carries the last observed state
    NotReady {
        /// State the block was last seen in before the wait gave up
        last: BlockState,
    },
    /// Global memory budget exhausted at pool construction or block creation
    CannotAllocate,
    /// Entry still pinned; remove/clear must wait for release
    BlockInUse,
    /// Every cache entry is pinned; nothing can be evicted
    NoEvictable,
    /// Operation requires a download manager and none is bound
    NotConfigured,
    /// Absolute start offset was already set for this use of the block
    AlreadySet,
    /// Block was already deallocated
    InvalidBuffer,
    /// Internal invariant broken by a caller; programming error
    ContractViolation(String),
    /// Operation or download cancelled
    Cancelled,
    /// Remote object does not exist
    ObjectNotFound,
    /// Transient source failure; eligible for retry
    Transient(String),
    /// Permanent source failure; retrying will not help
    Permanent(String),
    /// Underlying OS-level I/O failure (mmap, temp file, positional I/O)
    Io(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::Overflow => write!(f, "Write exceeds block capacity"),
            Self::OutOfBounds => write!(f, "Read offset out of bounds"),
            Self::NotReady { last } => {
                write!(f, "Wait cancelled; last observed state: {:?}", last)
            }
            Self::CannotAllocate => write!(f, "Global memory budget exhausted"),
            Self::BlockInUse => write!(f, "Block is pinned and cannot be removed"),
            Self::NoEvictable => write!(f, "All cache entries are pinned"),
            Self::NotConfigured => write!(f, "No download manager bound"),
            Self::AlreadySet => write!(f, "Absolute start offset already set"),
            Self::InvalidBuffer => write!(f, "Block already deallocated"),
            Self::ContractViolation(msg) => write!(f, "Contract violation: {}", msg),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::ObjectNotFound => write!(f, "Object not found"),
            Self::Transient(msg) => write!(f, "Transient source error: {}", msg),
            Self::Permanent(msg) => write!(f, "Permanent source error: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

impl CacheError {
    /// Whether a download hitting this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ============================================================================
// ERROR CONVERSION - interop with std::io and (optionally) anyhow
// ============================================================================

/// Convert CacheError to std::io::Error
impl From<CacheError> for std::io::Error {
    fn from(err: CacheError) -> Self {
        use std::io::ErrorKind;
        match err {
            CacheError::Overflow => std::io::Error::new(ErrorKind::WriteZero, err),
            CacheError::OutOfBounds => std::io::Error::new(ErrorKind::UnexpectedEof, err),
            CacheError::Cancelled | CacheError::NotReady { .. } => {
                std::io::Error::new(ErrorKind::Interrupted, err)
            }
            CacheError::ObjectNotFound => std::io::Error::new(ErrorKind::NotFound, err),
            CacheError::Io(msg) => std::io::Error::other(msg),
            _ => std::io::Error::other(err),
        }
    }
}

/// Convert std::io::Error to CacheError
impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

/// Convert CacheError to anyhow::Error
#[cfg(feature = "anyhow")]
impl From<CacheError> for anyhow::Error {
    fn from(err: CacheError) -> Self {
        anyhow::anyhow!("{}", err)
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for cache operations
///
/// Note: When using with other Result types (like anyhow::Result),
/// either qualify the type (`blockcache::Result<T>`) or use the conversion
/// traits.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Extension trait for converting Results between different error types
pub trait ResultExt<T> {
    /// Convert to anyhow::Result
    #[cfg(feature = "anyhow")]
    fn into_anyhow(self) -> anyhow::Result<T>;

    /// Convert to io::Result
    fn into_io(self) -> std::io::Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    #[cfg(feature = "anyhow")]
    fn into_anyhow(self) -> anyhow::Result<T> {
        self.map_err(|e| e.into())
    }

    fn into_io(self) -> std::io::Result<T> {
        self.map_err(|e| e.into())
    }
}
