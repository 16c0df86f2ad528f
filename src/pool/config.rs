// src/pool/config.rs
//! Configuration for block pools

use crate::error::{CacheError, Result};

/// Backing storage selector for a pool's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Anonymous private memory mappings
    Memory,
    /// Anonymous temp files
    Disk,
}

/// Configuration for block pool behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of each block in bytes
    pub block_size: usize,
    /// Maximum number of blocks the pool may hold
    pub max_blocks: usize,
    /// Backing storage for the pool's blocks
    pub block_type: BlockType,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_size: 8 * 1024 * 1024, // 8MB blocks
            max_blocks: 16,
            block_type: BlockType::Memory,
        }
    }
}

impl PoolConfig {
    /// Configuration for small sequential reads (low memory).
    pub fn small() -> Self {
        Self {
            block_size: 64 * 1024,
            max_blocks: 8,
            block_type: BlockType::Memory,
        }
    }

    /// Configuration for large prefetch windows on disk.
    pub fn large() -> Self {
        Self {
            block_size: 16 * 1024 * 1024,
            max_blocks: 64,
            block_type: BlockType::Disk,
        }
    }

    /// Rejects configurations that violate pool invariants.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(CacheError::InvalidConfig("block_size must be > 0".into()));
        }
        if self.max_blocks == 0 {
            return Err(CacheError::InvalidConfig("max_blocks must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = PoolConfig::default();
        config.block_size = 0;
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfig(_))
        ));

        let mut config = PoolConfig::default();
        config.max_blocks = 0;
        assert!(config.validate().is_err());
    }
}
