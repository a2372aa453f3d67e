//! Read access to the main chain, owned by the chain-tracking collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{Block, Txid};
use parking_lot::RwLock;

use crate::types::TxRef;

/// Main-chain view consumed by the scanner, the registry and the tracker.
pub trait ChainSource: Send + Sync {
    /// Height of the current tip, `None` while no block is known.
    fn top_height(&self) -> Option<u32>;

    fn block(&self, height: u32) -> Option<Arc<Block>>;

    /// Position of a main-chain transaction.
    fn tx_ref(&self, txid: &Txid) -> Option<TxRef>;
}

#[derive(Default)]
struct ChainState {
    blocks: Vec<Arc<Block>>,
    tx_index: HashMap<Txid, TxRef>,
}

/// In-process chain used by the binary and by tests.
#[derive(Default)]
pub struct MemoryChain {
    state: RwLock<ChainState>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `block` at the next height and returns that height.
    pub fn push_block(&self, block: Block) -> u32 {
        let mut s = self.state.write();
        let height = s.blocks.len() as u32;
        for (i, tx) in block.txdata.iter().enumerate() {
            s.tx_index.insert(
                tx.compute_txid(),
                TxRef::Mined {
                    height,
                    index: i as u32,
                },
            );
        }
        s.blocks.push(Arc::new(block));
        log::trace!("[CHAIN] pushed block at height {}", height);
        height
    }

    /// Drops every block above `branch_point`.
    pub fn rewind(&self, branch_point: u32) {
        let mut s = self.state.write();
        let keep = (branch_point as usize + 1).min(s.blocks.len());
        let orphaned: Vec<Arc<Block>> = s.blocks.drain(keep..).collect();
        for block in orphaned {
            for tx in &block.txdata {
                s.tx_index.remove(&tx.compute_txid());
            }
        }
        log::debug!("[CHAIN] rewound to height {}", branch_point);
    }
}

impl ChainSource for MemoryChain {
    fn top_height(&self) -> Option<u32> {
        let len = self.state.read().blocks.len();
        len.checked_sub(1).map(|h| h as u32)
    }

    fn block(&self, height: u32) -> Option<Arc<Block>> {
        self.state.read().blocks.get(height as usize).cloned()
    }

    fn tx_ref(&self, txid: &Txid) -> Option<TxRef> {
        self.state.read().tx_index.get(txid).copied()
    }
}
