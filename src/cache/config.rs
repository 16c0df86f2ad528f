// src/cache/config.rs
//! Configuration for the block cache

use crate::error::Result;
use crate::pool::{BlockType, PoolConfig};

/// Configuration for cache capacity and backing storage.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity of each cached block in bytes
    pub block_size: usize,
    /// Maximum number of cached blocks
    pub max_blocks: usize,
    /// Backing storage for cached blocks
    pub block_type: BlockType,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            block_size: pool.block_size,
            max_blocks: pool.max_blocks,
            block_type: pool.block_type,
        }
    }
}

impl CacheConfig {
    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            block_size: self.block_size,
            max_blocks: self.max_blocks,
            block_type: self.block_type,
        }
    }

    /// Rejects configurations that violate cache invariants.
    pub fn validate(&self) -> Result<()> {
        self.pool_config().validate()
    }
}
