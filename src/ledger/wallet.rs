use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitcoin::Txid;
use parking_lot::Mutex;

use crate::config::IndexConfig;
use crate::error::LedgerError;
use crate::ledger::{merge_entries, AddressLedger, HistoryPager};
use crate::mempool::MempoolView;
use crate::notify::{MempoolNotification, MempoolSubscriber};
use crate::store::HistoryStore;
use crate::types::{Balance, LedgerEntry, ScriptAddress};

/// Ledgers of one wallet's addresses, paged together.
pub struct WalletLedger {
    id: String,
    ledgers: BTreeMap<ScriptAddress, AddressLedger>,
    pager: Mutex<HistoryPager>,
    update_id: AtomicU64,
    errors: Mutex<Vec<(String, Txid)>>,
}

impl WalletLedger {
    pub fn new(
        id: impl Into<String>,
        addresses: &BTreeSet<ScriptAddress>,
        store: Arc<dyn HistoryStore>,
        view: MempoolView,
        config: &IndexConfig,
    ) -> Result<Self, LedgerError> {
        let mut ledgers = BTreeMap::new();
        for address in addresses {
            ledgers.insert(
                address.clone(),
                AddressLedger::new(address.clone(), store.clone(), view.clone(), config)?,
            );
        }

        let wallet = Self {
            id: id.into(),
            ledgers,
            pager: Mutex::new(HistoryPager::new(config.page_threshold)),
            update_id: AtomicU64::new(0),
            errors: Mutex::new(Vec::new()),
        };
        wallet.remap();
        Ok(wallet)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ScriptAddress> {
        self.ledgers.keys()
    }

    pub fn address_ledger(&self, address: &ScriptAddress) -> Result<&AddressLedger, LedgerError> {
        self.ledgers
            .get(address)
            .ok_or_else(|| LedgerError::UnknownAddress(address.clone()))
    }

    pub fn balance(&self) -> Balance {
        let mut total = Balance::default();
        for ledger in self.ledgers.values() {
            total += ledger.balance();
        }
        total
    }

    /// Sums the per-address summaries into the wallet pager.
    fn remap(&self) {
        let mut summary: BTreeMap<u32, u32> = BTreeMap::new();
        for ledger in self.ledgers.values() {
            for (height, count) in ledger.txio_per_height() {
                *summary.entry(height).or_default() += count;
            }
        }
        self.pager.lock().map_history(summary);
        self.update_id.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_new_blocks(&self) -> Result<(), LedgerError> {
        for ledger in self.ledgers.values() {
            ledger.refresh()?;
        }
        self.remap();
        Ok(())
    }

    pub fn update_after_reorg(&self, last_valid_height: u32) -> Result<(), LedgerError> {
        for ledger in self.ledgers.values() {
            ledger.update_after_reorg(last_valid_height)?;
        }
        self.remap();
        Ok(())
    }

    pub fn page_count(&self) -> usize {
        self.pager.lock().page_count()
    }

    pub fn total_count(&self) -> u64 {
        self.pager.lock().total_count()
    }

    /// Wallet-level entries of page `id`; one entry per transaction.
    pub fn history_page(&self, id: usize) -> Result<Arc<Vec<LedgerEntry>>, LedgerError> {
        let update_id = self.update_id.load(Ordering::Acquire);
        self.pager.lock().page_entries(id, update_id, |bottom, top| {
            let mut all = Vec::new();
            for ledger in self.ledgers.values() {
                all.extend(ledger.load_confirmed(bottom, top)?);
            }
            Ok(merge_entries(all))
        })
    }

    pub fn pending_entries(&self) -> Vec<LedgerEntry> {
        merge_entries(self.ledgers.values().flat_map(|l| l.pending_entries()))
    }

    /// Broadcast failures reported for this wallet.
    pub fn errors(&self) -> Vec<(String, Txid)> {
        self.errors.lock().clone()
    }
}

impl MempoolSubscriber for WalletLedger {
    fn address_filter(&self, address: &ScriptAddress) -> bool {
        self.ledgers.contains_key(address)
    }

    fn on_new_mempool_txio(&self, notification: &MempoolNotification) {
        let changed = self
            .ledgers
            .values()
            .filter(|ledger| ledger.scan_mempool(notification))
            .count();
        log::debug!("[LEDGER] wallet {}: {} addresses updated", self.id, changed);
    }

    fn on_error(&self, message: &str, txid: &Txid) {
        log::warn!("[LEDGER] wallet {}: {} ({})", self.id, message, txid);
        self.errors.lock().push((message.to_string(), *txid));
    }
}
