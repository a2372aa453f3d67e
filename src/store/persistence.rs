use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::memory::{MemoryStore, StoreData};
use crate::types::{ScriptAddress, TxIoPair};

pub const SNAPSHOT_MAGIC: &str = "zeroconf-index/1";

#[derive(Debug, Serialize, Deserialize)]
struct AddressRecord {
    address: ScriptAddress,
    sync_height: Option<u32>,
    txios: Vec<TxIoPair>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    magic: String,
    addresses: Vec<AddressRecord>,
}

impl From<&StoreData> for Snapshot {
    fn from(data: &StoreData) -> Self {
        let mut records: BTreeMap<&ScriptAddress, AddressRecord> = BTreeMap::new();
        for (address, height) in &data.sync_heights {
            records.insert(
                address,
                AddressRecord {
                    address: address.clone(),
                    sync_height: *height,
                    txios: Vec::new(),
                },
            );
        }
        for (address, history) in &data.histories {
            let record = records.entry(address).or_insert_with(|| AddressRecord {
                address: address.clone(),
                sync_height: None,
                txios: Vec::new(),
            });
            record.txios.extend(history.values().cloned());
        }

        Snapshot {
            magic: SNAPSHOT_MAGIC.to_string(),
            addresses: records.into_values().collect(),
        }
    }
}

impl TryFrom<Snapshot> for StoreData {
    type Error = StoreError;

    fn try_from(snapshot: Snapshot) -> Result<Self, StoreError> {
        if snapshot.magic != SNAPSHOT_MAGIC {
            return Err(StoreError::Corruption(format!(
                "unexpected snapshot magic {:?}",
                snapshot.magic
            )));
        }

        let mut data = StoreData::default();
        for record in snapshot.addresses {
            data.sync_heights
                .insert(record.address.clone(), record.sync_height);
            let history = data.histories.entry(record.address.clone()).or_default();
            for txio in record.txios {
                if txio.output.is_pending() {
                    return Err(StoreError::Corruption(format!(
                        "pending key {} in snapshot",
                        txio.output
                    )));
                }
                data.owners.insert(txio.output, record.address.clone());
                history.insert(txio.output, txio);
            }
        }
        Ok(data)
    }
}

/// Writes the store to `path` as JSON.
pub fn save_snapshot(store: &MemoryStore, path: impl AsRef<Path>) -> Result<(), StoreError> {
    let snapshot = Snapshot::from(&store.data());
    let raw = serde_json::to_vec_pretty(&snapshot)?;
    std::fs::write(path.as_ref(), raw)?;
    log::info!(
        "[STORE] saved {} addresses to {}",
        snapshot.addresses.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Opens the snapshot at `path`, or starts an empty store if none exists yet.
pub fn load_or_create(path: impl AsRef<Path>) -> Result<MemoryStore, StoreError> {
    let path = path.as_ref();
    if !path.exists() {
        log::info!("[STORE] no snapshot at {}, starting empty", path.display());
        return Ok(MemoryStore::new());
    }

    let raw = std::fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&raw)?;
    let data = StoreData::try_from(snapshot)?;
    log::info!(
        "[STORE] loaded {} addresses from {}",
        data.sync_heights.len(),
        path.display()
    );
    Ok(MemoryStore::from_data(data))
}
