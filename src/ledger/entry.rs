use std::collections::BTreeMap;

use bitcoin::Txid;

use crate::types::{IoKey, LedgerEntry, TxIoPair, TxRef};

/// Folds txios into one entry per transaction, newest first.
///
/// `keep` selects which sides count: a funding output is credited to the
/// funding transaction and a spend debited to the spending one only when
/// `keep` accepts the respective key. Multisig txios are not balance.
pub fn build_entries<'a, I, F>(txios: I, keep: F) -> Vec<LedgerEntry>
where
    I: IntoIterator<Item = &'a TxIoPair>,
    F: Fn(&IoKey) -> bool,
{
    let mut by_tx: BTreeMap<(TxRef, Txid), LedgerEntry> = BTreeMap::new();

    for txio in txios {
        if txio.flags.multisig {
            continue;
        }
        if keep(&txio.output) {
            credit(&mut by_tx, txio.output.tx, txio.output_txid, txio.value as i64, txio);
        }
        if let (Some(input), Some(input_txid)) = (txio.input, txio.input_txid) {
            if keep(&input) {
                credit(&mut by_tx, input.tx, input_txid, -(txio.value as i64), txio);
            }
        }
    }

    by_tx.into_values().rev().collect()
}

fn credit(
    by_tx: &mut BTreeMap<(TxRef, Txid), LedgerEntry>,
    tx_ref: TxRef,
    txid: Txid,
    value: i64,
    txio: &TxIoPair,
) {
    let entry = by_tx.entry((tx_ref, txid)).or_insert_with(|| LedgerEntry {
        txid,
        tx_ref,
        value: 0,
        rbf: false,
        chained: false,
    });
    entry.value += value;
    if tx_ref.is_pending() {
        entry.rbf |= txio.flags.rbf;
        entry.chained |= txio.flags.chained;
    }
}

/// Merges entries of several addresses; effects of the same transaction add up.
pub fn merge_entries<I>(entries: I) -> Vec<LedgerEntry>
where
    I: IntoIterator<Item = LedgerEntry>,
{
    let mut by_tx: BTreeMap<(TxRef, Txid), LedgerEntry> = BTreeMap::new();
    for e in entries {
        match by_tx.get_mut(&(e.tx_ref, e.txid)) {
            Some(existing) => {
                existing.value += e.value;
                existing.rbf |= e.rbf;
                existing.chained |= e.chained;
            }
            None => {
                by_tx.insert((e.tx_ref, e.txid), e);
            }
        }
    }
    by_tx.into_values().rev().collect()
}

/// Whether `key` was mined within `bottom..=top`.
pub fn mined_within(key: &IoKey, bottom: u32, top: u32) -> bool {
    key.height().map(|h| h >= bottom && h <= top).unwrap_or(false)
}
