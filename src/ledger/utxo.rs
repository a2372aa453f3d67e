use std::collections::BTreeMap;

use crate::types::{IoKey, TxIoPair};

/// Confirmed txios of one address, loaded block range by block range from the top.
#[derive(Debug, Clone, Default)]
pub struct UtxoCache {
    txios: BTreeMap<IoKey, TxIoPair>,
    /// Next height to load from, going down. `None` before the first fetch.
    cursor: Option<u32>,
    exhausted: bool,
}

impl UtxoCache {
    pub fn cursor(&self) -> Option<u32> {
        self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Stores the outputs funded within `bottom..=top` and moves the cursor below them.
    /// Returns how many unspent outputs were added.
    pub fn extend(&mut self, bottom: u32, top: u32, loaded: BTreeMap<IoKey, TxIoPair>) -> usize {
        let mut added = 0;
        for (key, txio) in loaded {
            let funded_here = key.height().map(|h| h >= bottom && h <= top).unwrap_or(false);
            if !funded_here {
                continue;
            }
            if !txio.is_spent() && !self.txios.contains_key(&key) {
                added += 1;
            }
            self.txios.insert(key, txio);
        }

        if bottom == 0 {
            self.exhausted = true;
        } else {
            self.cursor = Some(bottom - 1);
        }
        added
    }

    /// Confirmed, unspent, non-multisig outputs, oldest first.
    pub fn unspent(&self) -> impl Iterator<Item = &TxIoPair> {
        self.txios
            .values()
            .filter(|t| !t.is_spent() && !t.flags.multisig)
    }

    pub fn get(&self, key: &IoKey) -> Option<&TxIoPair> {
        self.txios.get(key)
    }

    pub fn len(&self) -> usize {
        self.txios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txios.is_empty()
    }

    /// Forgets everything above `last_valid_height`: outputs mined there are
    /// deleted, spends mined there are cleared. Loading resumes from the top.
    pub fn rollback(&mut self, last_valid_height: u32) {
        self.txios.retain(|_, txio| {
            txio.output
                .height()
                .map(|h| h <= last_valid_height)
                .unwrap_or(false)
        });
        for txio in self.txios.values_mut() {
            if txio.input_height().map(|h| h > last_valid_height).unwrap_or(false) {
                txio.clear_spend();
            }
        }
        self.cursor = None;
        self.exhausted = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
