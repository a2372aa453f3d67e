//! Balances, UTXOs and ledger pages of tracked addresses.
//!
//! An [`AddressLedger`] combines the confirmed summary from the store with
//! the tracker's pending txios for its address. The pending overlay is
//! replaced wholesale from each mempool notification, so a ledger never
//! walks the whole pool.

mod entry;
mod pager;
mod utxo;
mod wallet;


use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::IndexConfig;
use crate::error::LedgerError;
use crate::mempool::MempoolView;
use crate::notify::{MempoolNotification, TxIoMap};
use crate::store::{HistoryStore, HistorySummary};
use crate::types::{clear_pending_effects, Balance, IoKey, LedgerEntry, ScriptAddress, TxIoPair};

pub use entry::{build_entries, merge_entries};
pub use pager::{HistoryPage, HistoryPager};
pub use utxo::UtxoCache;
pub use wallet::WalletLedger;

use entry::mined_within;

struct LedgerState {
    summary: HistorySummary,
    pending: Arc<TxIoMap>,
    pager: HistoryPager,
    utxos: UtxoCache,
    /// Bumped whenever the confirmed history changes; invalidates cached pages.
    update_id: u64,
}

pub struct AddressLedger {
    address: ScriptAddress,
    store: Arc<dyn HistoryStore>,
    view: MempoolView,
    utxos_per_fetch: u32,
    state: Mutex<LedgerState>,
}

impl AddressLedger {
    pub fn new(
        address: ScriptAddress,
        store: Arc<dyn HistoryStore>,
        view: MempoolView,
        config: &IndexConfig,
    ) -> Result<Self, LedgerError> {
        let summary = store.summary(&address)?;
        let mut pager = HistoryPager::new(config.page_threshold);
        pager.map_history(summary.txio_per_height.clone());
        let pending = view.txios_for(&address).unwrap_or_default();

        Ok(Self {
            address,
            store,
            view,
            utxos_per_fetch: config.utxos_per_fetch,
            state: Mutex::new(LedgerState {
                summary,
                pending,
                pager,
                utxos: UtxoCache::default(),
                update_id: 0,
            }),
        })
    }

    pub fn address(&self) -> &ScriptAddress {
        &self.address
    }

    /// Reloads the confirmed summary and remaps the pages after new blocks.
    pub fn refresh(&self) -> Result<(), LedgerError> {
        let summary = self.store.summary(&self.address)?;
        let mut state = self.state.lock();
        state.pager.map_history(summary.txio_per_height.clone());
        state.summary = summary;
        state.utxos.reset();
        state.update_id += 1;
        Ok(())
    }

    pub fn summary(&self) -> HistorySummary {
        self.state.lock().summary.clone()
    }

    pub fn txio_per_height(&self) -> std::collections::BTreeMap<u32, u32> {
        self.state.lock().summary.txio_per_height.clone()
    }

    // =====================================================================
    // Balances
    // =====================================================================

    pub fn confirmed_balance(&self) -> u64 {
        self.state.lock().summary.balance
    }

    /// Confirmed balance plus pending fundings minus pending spends.
    pub fn full_balance(&self) -> i64 {
        let state = self.state.lock();
        let mut full = state.summary.balance as i64;
        for txio in state.pending.values().filter(|t| !t.flags.multisig) {
            if txio.has_pending_output() {
                full += txio.value as i64;
            }
            if txio.has_pending_input() {
                full -= txio.value as i64;
            }
        }
        full
    }

    /// Confirmed balance without the outputs a pending transaction spends.
    pub fn spendable_balance(&self) -> u64 {
        let state = self.state.lock();
        let locked: u64 = state
            .pending
            .values()
            .filter(|t| !t.flags.multisig && !t.has_pending_output() && t.is_spent())
            .map(|t| t.value)
            .sum();
        state.summary.balance.saturating_sub(locked)
    }

    /// Pending outputs nothing spends yet.
    pub fn unconfirmed_balance(&self) -> u64 {
        self.state
            .lock()
            .pending
            .values()
            .filter(|t| !t.flags.multisig && t.has_pending_output() && !t.is_spent())
            .map(|t| t.value)
            .sum()
    }

    pub fn balance(&self) -> Balance {
        Balance {
            full: self.full_balance(),
            spendable: self.spendable_balance(),
            unconfirmed: self.unconfirmed_balance(),
        }
    }

    // =====================================================================
    // Mempool overlay
    // =====================================================================

    /// Applies a mempool notification. Returns true if the overlay changed.
    pub fn scan_mempool(&self, notification: &MempoolNotification) -> bool {
        let mut state = self.state.lock();
        if let Some(map) = notification.txios.get(&self.address) {
            if Arc::ptr_eq(map, &state.pending) {
                return false;
            }
            state.pending = map.clone();
            log::trace!(
                "[LEDGER] {} now has {} pending txios",
                self.address,
                state.pending.len()
            );
            return true;
        }

        let touched = notification
            .invalidated
            .iter()
            .any(|id| state.pending.values().any(|t| t.touches_pending(*id)));
        if !touched {
            return false;
        }
        let pending = Arc::make_mut(&mut state.pending);
        for id in &notification.invalidated {
            clear_pending_effects(pending, *id);
        }
        true
    }

    pub fn pending_txios(&self) -> Arc<TxIoMap> {
        self.state.lock().pending.clone()
    }

    /// Net effect of each pooled transaction on this address.
    pub fn pending_entries(&self) -> Vec<LedgerEntry> {
        let pending = self.pending_txios();
        build_entries(pending.values(), |key| key.is_pending())
    }

    // =====================================================================
    // Confirmed history
    // =====================================================================

    /// Net effect of each transaction mined within `start..=end`.
    pub fn load_confirmed(&self, start: u32, end: u32) -> Result<Vec<LedgerEntry>, LedgerError> {
        confirmed_entries(self.store.as_ref(), &self.address, start, end)
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().pager.page_count()
    }

    pub fn history_page(&self, id: usize) -> Result<Arc<Vec<LedgerEntry>>, LedgerError> {
        let mut state = self.state.lock();
        let update_id = state.update_id;
        let store = self.store.as_ref();
        let address = &self.address;
        state
            .pager
            .page_entries(id, update_id, |bottom, top| {
                confirmed_entries(store, address, bottom, top)
            })
    }

    pub fn page_for_height(&self, height: u32) -> Result<usize, LedgerError> {
        Ok(self.state.lock().pager.page_for_height(height)?)
    }

    /// Drops cached state above `last_valid_height` and reloads the summary.
    pub fn update_after_reorg(&self, last_valid_height: u32) -> Result<(), LedgerError> {
        let summary = self.store.summary(&self.address)?;
        let mut state = self.state.lock();
        state.utxos.rollback(last_valid_height);
        state.pager.map_history(summary.txio_per_height.clone());
        state.summary = summary;
        state.update_id += 1;
        log::debug!(
            "[LEDGER] {} rolled back above height {}",
            self.address,
            last_valid_height
        );
        Ok(())
    }

    // =====================================================================
    // UTXOs
    // =====================================================================

    /// Loads confirmed outputs further down the history until at least
    /// `utxos_per_fetch` new unspent ones are cached or the history runs out.
    pub fn fetch_more_utxos(&self) -> Result<usize, LedgerError> {
        let mut state = self.state.lock();
        let mut added = 0;

        while !state.utxos.is_exhausted() && added < self.utxos_per_fetch as usize {
            let from = state.utxos.cursor().unwrap_or(u32::MAX);
            let (bottom, top) = state
                .pager
                .range_for_height_and_count(from, self.utxos_per_fetch);
            let loaded = self.store.history(&self.address, bottom, top)?;
            added += state.utxos.extend(bottom, top, loaded);
        }

        log::trace!("[LEDGER] {} cached {} more utxos", self.address, added);
        Ok(added)
    }

    /// Spendable confirmed outputs, oldest first, covering `value_target` if the
    /// history allows. A target of 0 returns what one fetch round yields.
    pub fn spendable_utxos(&self, value_target: u64) -> Result<Vec<TxIoPair>, LedgerError> {
        loop {
            let (utxos, exhausted) = {
                let state = self.state.lock();
                let utxos: Vec<TxIoPair> = state
                    .utxos
                    .unspent()
                    .filter(|t| !self.view.is_output_spent(&t.output))
                    .cloned()
                    .collect();
                (utxos, state.utxos.is_exhausted())
            };

            let total: u64 = utxos.iter().map(|t| t.value).sum();
            let fetched_once = self.state.lock().utxos.cursor().is_some() || exhausted;
            if exhausted || (fetched_once && total >= value_target) {
                return Ok(utxos);
            }
            self.fetch_more_utxos()?;
        }
    }

    /// Whether the confirmed output `key` is unspent on chain and in the pool.
    pub fn is_output_spendable(&self, key: &IoKey) -> Result<bool, LedgerError> {
        if key.is_pending() || self.view.is_output_spent(key) {
            return Ok(false);
        }
        let cached = self.state.lock().utxos.get(key).cloned();
        let txio = match cached {
            Some(txio) => Some(txio),
            None => self.store.output(key)?.map(|s| s.txio),
        };
        Ok(txio
            .map(|t| !t.is_spent() && !t.flags.multisig)
            .unwrap_or(false))
    }

    /// Pending outputs paying this address that nothing spends yet.
    pub fn unconfirmed_utxos(&self) -> Vec<TxIoPair> {
        self.view.unspent_for(&self.address)
    }
}

fn confirmed_entries(
    store: &dyn HistoryStore,
    address: &ScriptAddress,
    start: u32,
    end: u32,
) -> Result<Vec<LedgerEntry>, LedgerError> {
    let txios = store.history(address, start, end)?;
    Ok(build_entries(txios.values(), |key| mined_within(key, start, end)))
}
