use std::collections::{BTreeSet, HashMap};

use bitcoin::OutPoint;

use crate::chain::ChainSource;
use crate::error::ScanError;
use crate::store::{HistoryStore, WriteBatch, WriteOp};
use crate::types::{IoKey, ScriptAddress, TxIoFlags, TxIoPair, TxRef};

/// Walks main-chain blocks and turns them into index writes for a set of addresses.
pub struct BlockScanner<'a> {
    chain: &'a dyn ChainSource,
    store: &'a dyn HistoryStore,
}

impl<'a> BlockScanner<'a> {
    pub fn new(chain: &'a dyn ChainSource, store: &'a dyn HistoryStore) -> Self {
        Self { chain, store }
    }

    /// Scans `start..=end` for `addresses`.
    ///
    /// With `fresh` set, the store's existing records are ignored: the caller
    /// wipes the addresses and the scan starts from genesis, so every output
    /// they can spend is created inside the scanned range.
    pub fn scan(
        &self,
        addresses: &BTreeSet<ScriptAddress>,
        start: u32,
        end: u32,
        fresh: bool,
    ) -> Result<WriteBatch, ScanError> {
        let mut batch = WriteBatch::new();
        if addresses.is_empty() || start > end {
            return Ok(batch);
        }

        let mut staged: HashMap<OutPoint, (ScriptAddress, IoKey)> = HashMap::new();

        for height in start..=end {
            let block = self
                .chain
                .block(height)
                .ok_or(ScanError::MissingBlock(height))?;

            for (tx_index, tx) in block.txdata.iter().enumerate() {
                let txid = tx.compute_txid();
                let tx_index = tx_index as u32;

                if !tx.is_coinbase() {
                    for (vin, input) in tx.input.iter().enumerate() {
                        let prev = input.previous_output;
                        let owner = match staged.remove(&prev) {
                            Some(owner) => Some(owner),
                            None if fresh => None,
                            None => self.stored_owner(&prev, addresses)?,
                        };
                        if let Some((address, output)) = owner {
                            batch.push(WriteOp::Spend {
                                address,
                                output,
                                input: IoKey::mined(height, tx_index, vin as u32),
                                input_txid: txid,
                            });
                        }
                    }
                }

                let rbf = tx.is_explicitly_rbf();
                for (vout, out) in tx.output.iter().enumerate() {
                    let address = ScriptAddress::from_script(&out.script_pubkey);
                    if !addresses.contains(&address) {
                        continue;
                    }
                    let key = IoKey::mined(height, tx_index, vout as u32);
                    let flags = TxIoFlags {
                        rbf,
                        chained: false,
                        multisig: address.is_multisig(),
                    };
                    staged.insert(
                        OutPoint {
                            txid,
                            vout: vout as u32,
                        },
                        (address.clone(), key),
                    );
                    batch.push(WriteOp::Fund {
                        address,
                        txio: TxIoPair::funding(key, txid, out.value.to_sat()).with_flags(flags),
                    });
                }
            }
        }

        log::debug!(
            "[SCAN] {} addresses, heights {}..={} -> {} writes",
            addresses.len(),
            start,
            end,
            batch.len()
        );
        Ok(batch)
    }

    fn stored_owner(
        &self,
        prev: &OutPoint,
        addresses: &BTreeSet<ScriptAddress>,
    ) -> Result<Option<(ScriptAddress, IoKey)>, ScanError> {
        let Some(TxRef::Mined { height, index }) = self.chain.tx_ref(&prev.txid) else {
            return Ok(None);
        };
        let key = IoKey::mined(height, index, prev.vout);
        Ok(self
            .store
            .output(&key)?
            .filter(|stored| addresses.contains(&stored.address))
            .map(|stored| (stored.address, key)))
    }
}
