//! Confirmed per-address history, as consumed from the storage collaborator.

pub mod memory;
pub mod persistence;


use std::collections::BTreeMap;

use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{IoKey, ScriptAddress, TxIoPair};

pub use memory::MemoryStore;

/// A confirmed output paying a tracked address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutput {
    pub address: ScriptAddress,
    pub txio: TxIoPair,
}

/// Script-history summary of one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySummary {
    pub sync_height: Option<u32>,
    /// Number of txio events (fundings and spends) per block height.
    pub txio_per_height: BTreeMap<u32, u32>,
    /// Unspent, non-multisig confirmed value.
    pub balance: u64,
    pub txio_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Credits a confirmed output to `address`. Existing records are kept.
    Fund { address: ScriptAddress, txio: TxIoPair },
    /// Marks a confirmed output of `address` as spent by `input`.
    Spend {
        address: ScriptAddress,
        output: IoKey,
        input: IoKey,
        input_txid: Txid,
    },
    SetSyncHeight {
        address: ScriptAddress,
        height: Option<u32>,
    },
    /// Deletes every record of `address`, including its sync height.
    Wipe { address: ScriptAddress },
    /// Undoes everything mined above `above`.
    Rollback { above: u32 },
}

/// Ordered list of writes applied all-or-nothing by [`HistoryStore::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn append(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type Item = WriteOp;
    type IntoIter = std::vec::IntoIter<WriteOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Transactional key-value view of the confirmed index.
pub trait HistoryStore: Send + Sync {
    fn output(&self, key: &IoKey) -> Result<Option<StoredOutput>, StoreError>;

    /// Txios of `address` whose funding or spend was mined in `start..=end`.
    fn history(
        &self,
        address: &ScriptAddress,
        start: u32,
        end: u32,
    ) -> Result<BTreeMap<IoKey, TxIoPair>, StoreError>;

    fn summary(&self, address: &ScriptAddress) -> Result<HistorySummary, StoreError>;

    /// Every address holding a sync-height record.
    fn tracked(&self) -> Result<Vec<(ScriptAddress, Option<u32>)>, StoreError>;

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}
