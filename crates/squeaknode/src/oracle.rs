//! The blockchain view a node anchors squeaks to.

use async_trait::async_trait;

use squeaknode_core::BlockHash;

use crate::error::Result;

/// A block as the oracle reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u64,
    pub hash: BlockHash,
    /// Unix seconds.
    pub time: i64,
}

/// Read-only access to the best chain.
#[async_trait]
pub trait BlockchainOracle: Send + Sync {
    async fn best_block_height(&self) -> Result<u64>;

    /// The block at `height` on the best chain, or `None` above the tip.
    async fn get_block_info(&self, height: u64) -> Result<Option<BlockInfo>>;

    /// The current tip.
    async fn best_block(&self) -> Result<BlockInfo> {
        let height = self.best_block_height().await?;
        self.get_block_info(height).await?.ok_or_else(|| {
            crate::error::NodeError::Oracle(format!("tip {} has no block info", height))
        })
    }
}

/// An in-memory chain for testing.
pub mod memory {
    use super::*;
    use tokio::sync::RwLock;

    use crate::error::NodeError;

    /// Genesis time of every memory chain.
    const GENESIS_TIME: i64 = 1_600_000_000;

    #[derive(Default)]
    struct ChainState {
        blocks: Vec<BlockInfo>,
        unreachable: bool,
    }

    /// A chain of synthetic blocks, ten minutes apart.
    #[derive(Default)]
    pub struct MemoryChain {
        state: RwLock<ChainState>,
    }

    /// Deterministic synthetic hash for `height` on fork `fork`.
    pub fn synthetic_hash(height: u64, fork: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&height.to_be_bytes());
        bytes[31] = fork;
        BlockHash::from_bytes(bytes)
    }

    impl MemoryChain {
        /// A chain with blocks `0..=tip`.
        pub fn with_height(tip: u64) -> Self {
            let blocks = (0..=tip)
                .map(|height| BlockInfo {
                    height,
                    hash: synthetic_hash(height, 0),
                    time: GENESIS_TIME + height as i64 * 600,
                })
                .collect();
            Self {
                state: RwLock::new(ChainState {
                    blocks,
                    unreachable: false,
                }),
            }
        }

        /// Mine one block and return its height.
        pub async fn mine(&self) -> u64 {
            let mut state = self.state.write().await;
            let height = state.blocks.len() as u64;
            state.blocks.push(BlockInfo {
                height,
                hash: synthetic_hash(height, 0),
                time: GENESIS_TIME + height as i64 * 600,
            });
            height
        }

        /// Replace every block from `height` up with a competing fork.
        pub async fn reorg(&self, height: u64, fork: u8) {
            let mut state = self.state.write().await;
            for block in state.blocks.iter_mut().filter(|b| b.height >= height) {
                block.hash = synthetic_hash(block.height, fork);
            }
        }

        /// Make every call fail until reset.
        pub async fn set_unreachable(&self, unreachable: bool) {
            self.state.write().await.unreachable = unreachable;
        }
    }

    #[async_trait]
    impl BlockchainOracle for MemoryChain {
        async fn best_block_height(&self) -> Result<u64> {
            let state = self.state.read().await;
            if state.unreachable {
                return Err(NodeError::Oracle("unreachable".into()));
            }
            state
                .blocks
                .len()
                .checked_sub(1)
                .map(|tip| tip as u64)
                .ok_or_else(|| NodeError::Oracle("empty chain".into()))
        }

        async fn get_block_info(&self, height: u64) -> Result<Option<BlockInfo>> {
            let state = self.state.read().await;
            if state.unreachable {
                return Err(NodeError::Oracle("unreachable".into()));
            }
            Ok(usize::try_from(height)
                .ok()
                .and_then(|h| state.blocks.get(h))
                .copied())
        }
    }
}
