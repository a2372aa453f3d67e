use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::store::{HistoryStore, HistorySummary, StoredOutput, WriteBatch, WriteOp};
use crate::types::{IoKey, ScriptAddress, TxIoPair};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoreData {
    /// output key -> owning address
    pub(crate) owners: BTreeMap<IoKey, ScriptAddress>,
    pub(crate) histories: BTreeMap<ScriptAddress, BTreeMap<IoKey, TxIoPair>>,
    pub(crate) sync_heights: BTreeMap<ScriptAddress, Option<u32>>,
}

impl StoreData {
    fn apply(&mut self, op: WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::Fund { address, txio } => {
                let key = txio.output;
                if key.is_pending() {
                    return Err(StoreError::Corruption(format!(
                        "pending key {} cannot be stored",
                        key
                    )));
                }
                let history = self.histories.entry(address.clone()).or_default();
                if !history.contains_key(&key) {
                    history.insert(key, txio);
                    self.owners.insert(key, address);
                }
            }
            WriteOp::Spend {
                address,
                output,
                input,
                input_txid,
            } => {
                let txio = self
                    .histories
                    .get_mut(&address)
                    .and_then(|h| h.get_mut(&output))
                    .ok_or_else(|| {
                        StoreError::Corruption(format!(
                            "spend of unknown output {} for {}",
                            output, address
                        ))
                    })?;
                txio.spend(input, input_txid);
            }
            WriteOp::SetSyncHeight { address, height } => {
                self.sync_heights.insert(address, height);
            }
            WriteOp::Wipe { address } => {
                if let Some(history) = self.histories.remove(&address) {
                    for key in history.keys() {
                        self.owners.remove(key);
                    }
                }
                self.sync_heights.remove(&address);
            }
            WriteOp::Rollback { above } => self.rollback(above),
        }
        Ok(())
    }

    fn rollback(&mut self, above: u32) {
        for history in self.histories.values_mut() {
            history.retain(|_, txio| txio.output.height().map(|h| h <= above).unwrap_or(false));
            for txio in history.values_mut() {
                if txio.input_height().map(|h| h > above).unwrap_or(false) {
                    txio.clear_spend();
                }
            }
        }
        self.owners
            .retain(|key, _| key.height().map(|h| h <= above).unwrap_or(false));
        for height in self.sync_heights.values_mut() {
            if let Some(h) = height {
                if *h > above {
                    *h = above;
                }
            }
        }
    }
}

/// Ordered in-memory maps behind a single lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_data(data: StoreData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub(crate) fn data(&self) -> StoreData {
        self.data.read().clone()
    }
}

impl HistoryStore for MemoryStore {
    fn output(&self, key: &IoKey) -> Result<Option<StoredOutput>, StoreError> {
        let data = self.data.read();
        let Some(address) = data.owners.get(key) else {
            return Ok(None);
        };
        let txio = data
            .histories
            .get(address)
            .and_then(|h| h.get(key))
            .cloned()
            .ok_or_else(|| StoreError::Corruption(format!("dangling owner record {}", key)))?;
        Ok(Some(StoredOutput {
            address: address.clone(),
            txio,
        }))
    }

    fn history(
        &self,
        address: &ScriptAddress,
        start: u32,
        end: u32,
    ) -> Result<BTreeMap<IoKey, TxIoPair>, StoreError> {
        let data = self.data.read();
        let in_range = |h: Option<u32>| h.map(|h| h >= start && h <= end).unwrap_or(false);

        Ok(data
            .histories
            .get(address)
            .map(|history| {
                history
                    .iter()
                    .filter(|(_, txio)| in_range(txio.output.height()) || in_range(txio.input_height()))
                    .map(|(k, v)| (*k, v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn summary(&self, address: &ScriptAddress) -> Result<HistorySummary, StoreError> {
        let data = self.data.read();
        let mut summary = HistorySummary {
            sync_height: data.sync_heights.get(address).copied().flatten(),
            ..HistorySummary::default()
        };

        if let Some(history) = data.histories.get(address) {
            for txio in history.values() {
                for height in [txio.output.height(), txio.input_height()].into_iter().flatten() {
                    *summary.txio_per_height.entry(height).or_default() += 1;
                    summary.txio_count += 1;
                }
                if !txio.is_spent() && !txio.flags.multisig {
                    summary.balance += txio.value;
                }
            }
        }

        Ok(summary)
    }

    fn tracked(&self) -> Result<Vec<(ScriptAddress, Option<u32>)>, StoreError> {
        let data = self.data.read();
        Ok(data
            .sync_heights
            .iter()
            .map(|(a, h)| (a.clone(), *h))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write();
        let mut staged = data.clone();
        let count = batch.len();
        for op in batch {
            staged.apply(op)?;
        }
        *data = staged;
        log::trace!("[STORE] committed {} ops", count);
        Ok(())
    }
}
