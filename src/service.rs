//! Wiring of registry, tracker and wallet ledgers around one store and chain.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::chain::ChainSource;
use crate::config::IndexConfig;
use crate::error::ServiceError;
use crate::fetcher::TxFetcher;
use crate::ledger::WalletLedger;
use crate::mempool::{MempoolTracker, PurgeOutcome};
use crate::registry::AddressRegistry;
use crate::store::HistoryStore;
use crate::sync::Signal;
use crate::types::{ReorgState, ScriptAddress};

pub struct IndexService {
    config: IndexConfig,
    store: Arc<dyn HistoryStore>,
    registry: AddressRegistry,
    tracker: MempoolTracker,
    wallets: RwLock<BTreeMap<String, Arc<WalletLedger>>>,
}

impl IndexService {
    pub fn new(
        config: IndexConfig,
        store: Arc<dyn HistoryStore>,
        chain: Arc<dyn ChainSource>,
        fetcher: Arc<dyn TxFetcher>,
    ) -> Result<Self, ServiceError> {
        let registry = AddressRegistry::new(store.clone(), chain.clone());
        registry.start()?;
        let tracker = MempoolTracker::new(
            config.clone(),
            store.clone(),
            chain,
            fetcher,
            Arc::new(registry.clone()),
        );
        log::info!("[SERVICE] index service up");

        Ok(Self {
            config,
            store,
            registry,
            tracker,
            wallets: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &MempoolTracker {
        &self.tracker
    }

    pub fn wallet(&self, id: &str) -> Option<Arc<WalletLedger>> {
        self.wallets.read().get(id).cloned()
    }

    /// Registers `addresses` under wallet `id`, waits for their history and
    /// subscribes the resulting ledger to mempool updates.
    pub fn register_wallet(
        &self,
        id: &str,
        addresses: BTreeSet<ScriptAddress>,
        is_new: bool,
    ) -> Result<Arc<WalletLedger>, ServiceError> {
        if self.wallets.read().contains_key(id) {
            return Err(ServiceError::DuplicateWallet(id.to_string()));
        }

        let done = Signal::new();
        let cb = done.clone();
        self.registry
            .register_addresses(addresses.clone(), id, is_new, move |ok| {
                cb.set(ok);
            })?;
        if !done.wait() {
            return Err(ServiceError::RegistrationFailed(id.to_string()));
        }

        let wallet = Arc::new(WalletLedger::new(
            id,
            &addresses,
            self.store.clone(),
            self.tracker.view(),
            &self.config,
        )?);
        self.tracker.add_subscriber(id, wallet.clone());
        self.wallets.write().insert(id.to_string(), wallet.clone());
        log::info!("[SERVICE] wallet {} ready ({} addresses)", id, addresses.len());
        Ok(wallet)
    }

    pub fn remove_wallet(&self, id: &str) -> bool {
        self.tracker.remove_subscriber(id);
        self.wallets.write().remove(id).is_some()
    }

    /// Chain-tip change: the confirmed index first, ledgers second, the pool last,
    /// so pool notifications land on already updated confirmed balances.
    pub fn on_new_blocks(&self, reorg: &ReorgState) -> Result<PurgeOutcome, ServiceError> {
        self.registry.on_new_blocks(reorg)?;

        let wallets: Vec<Arc<WalletLedger>> = self.wallets.read().values().cloned().collect();
        for wallet in wallets {
            if reorg.previous_top_still_valid {
                wallet.on_new_blocks()?;
            } else {
                wallet.update_after_reorg(reorg.last_valid_height())?;
            }
        }

        let outcome = self.tracker.purge(reorg)?;
        log::debug!(
            "[SERVICE] top {} -> {}: {} pending transactions left the pool",
            reorg.previous_top,
            reorg.new_top,
            outcome.invalidated.len()
        );
        Ok(outcome)
    }

    pub fn shutdown(&self) {
        self.tracker.shutdown();
        self.registry.shutdown();
        log::info!("[SERVICE] index service stopped");
    }
}
