use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bitcoin::{Transaction, Txid};

use crate::mempool::parsed::ParsedTx;
use crate::notify::TxIoMap;
use crate::types::{IoKey, ScriptAddress, TxIoPair};

/// Immutable view of the pool. Writers clone, mutate and swap.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub txs: BTreeMap<u32, Arc<ParsedTx>>,

    /// txid -> pending id
    pub by_hash: HashMap<Txid, u32>,

    /// registered address -> pending txios, shared between snapshots until written
    pub txios: HashMap<ScriptAddress, Arc<TxIoMap>>,

    /// output key (confirmed or pending) -> id of the pooled spender
    pub spent_outputs: HashMap<IoKey, u32>,

    /// parent txid -> (vout -> id of the pooled spender)
    pub spenders: HashMap<Txid, BTreeMap<u32, u32>>,

    /// pending id -> addresses holding txios of that transaction
    pub touched: HashMap<u32, BTreeSet<ScriptAddress>>,
}

impl PoolSnapshot {
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn get(&self, txid: &Txid) -> Option<&Arc<ParsedTx>> {
        self.by_hash.get(txid).and_then(|id| self.txs.get(id))
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.by_hash.contains_key(txid)
    }

    pub fn is_output_spent(&self, key: &IoKey) -> bool {
        self.spent_outputs.contains_key(key)
    }

    pub fn txios_for(&self, address: &ScriptAddress) -> Option<Arc<TxIoMap>> {
        self.txios.get(address).cloned()
    }

    /// Ids of pooled transactions spending outputs of `txid`.
    pub fn children_of(&self, txid: &Txid) -> Vec<u32> {
        self.spenders
            .get(txid)
            .map(|by_vout| by_vout.values().copied().collect())
            .unwrap_or_default()
    }
}

/// Read handle on the live pool, handed to ledgers and viewers.
#[derive(Clone, Default)]
pub struct MempoolView {
    snapshot: Arc<ArcSwap<PoolSnapshot>>,
}

impl MempoolView {
    pub(crate) fn install(&self, snapshot: Arc<PoolSnapshot>) {
        self.snapshot.store(snapshot);
    }

    pub fn load(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_transaction(&self, txid: &Txid) -> bool {
        self.snapshot.load().contains(txid)
    }

    pub fn get_transaction(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.snapshot.load().get(txid).map(|tx| tx.tx.clone())
    }

    pub fn is_output_spent(&self, key: &IoKey) -> bool {
        self.snapshot.load().is_output_spent(key)
    }

    pub fn txios_for(&self, address: &ScriptAddress) -> Option<Arc<TxIoMap>> {
        self.snapshot.load().txios_for(address)
    }

    /// Pending outputs of `address` that no pooled transaction spends.
    pub fn unspent_for(&self, address: &ScriptAddress) -> Vec<TxIoPair> {
        self.txios_for(address)
            .map(|m| {
                m.values()
                    .filter(|t| t.has_pending_output() && !t.is_spent())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pending txios of `address` that could still be replaced by fee.
    pub fn rbf_txios_for(&self, address: &ScriptAddress) -> Vec<TxIoPair> {
        self.txios_for(address)
            .map(|m| m.values().filter(|t| t.flags.rbf).cloned().collect())
            .unwrap_or_default()
    }
}
