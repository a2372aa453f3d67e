//! Registry of tracked script addresses.
//!
//! Registration resolves each batch against three sets, in order:
//! * addresses claimed by an in-flight side-scan are split off and the batch
//!   callback is chained behind that scan;
//! * addresses already registered and synced need nothing;
//! * the rest is either stamped at the current top (`is_new`) or side-scanned
//!   from genesis on a detached thread.
//!
//! Finished scans land in a merge pile. Merging is exclusive (merge lock):
//! it commits the scan writes, re-applies blocks mined while the scan ran,
//! publishes the addresses and fires the callbacks.

mod batch;


use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::chain::ChainSource;
use crate::error::RegistryError;
use crate::scanner::BlockScanner;
use crate::store::{HistoryStore, WriteBatch, WriteOp};
use crate::sync::Signal;
use crate::types::{ReorgState, ScriptAddress};

pub use batch::{AddressBatch, RegistrationCallback};
use batch::{InFlight, PendingCallback};

/// Read-only view of the registered address set.
pub trait AddressFilter: Send + Sync {
    fn is_registered(&self, address: &ScriptAddress) -> bool;
    fn registered_count(&self) -> usize;
}

type AddressMap = BTreeMap<ScriptAddress, Option<u32>>;

/// Batch id of the catch-up scan `start` runs for addresses registered unsynced.
const UNSYNCED_BATCH: &str = "<unsynced>";

struct ScanJob {
    batch_ids: Vec<String>,
    addresses: BTreeSet<ScriptAddress>,
    callbacks: Vec<PendingCallback>,
    epoch: u64,
}

struct ScanResult {
    job: ScanJob,
    scanned_to: u32,
    writes: WriteBatch,
}

struct MergeState {
    in_flight: Vec<InFlight>,
}

struct RegistryInner {
    store: Arc<dyn HistoryStore>,
    chain: Arc<dyn ChainSource>,

    /// Registered addresses and their sync heights; swapped whole.
    addresses: ArcSwap<AddressMap>,

    /// Guards in-flight bookkeeping and every store write issued by the registry.
    merge_lock: Mutex<MergeState>,
    merge_pile: Mutex<Vec<ScanResult>>,

    started: AtomicBool,
    terminated: AtomicBool,
    /// Bumped on every reorg so that scans started before it are redone.
    reorg_epoch: AtomicU64,
    scans_started: AtomicUsize,
    fatal: Mutex<Option<String>>,
}

/// Owner of the tracked address set. Cheap to clone.
#[derive(Clone)]
pub struct AddressRegistry {
    inner: Arc<RegistryInner>,
}

impl AddressRegistry {
    pub fn new(store: Arc<dyn HistoryStore>, chain: Arc<dyn ChainSource>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                chain,
                addresses: ArcSwap::from_pointee(AddressMap::new()),
                merge_lock: Mutex::new(MergeState {
                    in_flight: Vec::new(),
                }),
                merge_pile: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                reorg_epoch: AtomicU64::new(0),
                scans_started: AtomicUsize::new(0),
                fatal: Mutex::new(None),
            }),
        }
    }

    /// Loads the persisted registrations and enables side-scans.
    ///
    /// Before `start`, registrations are recorded unsynced and complete at once.
    /// If the chain already has blocks, unsynced addresses are side-scanned
    /// from genesis; otherwise the first `on_new_blocks` indexes them.
    pub fn start(&self) -> Result<(), RegistryError> {
        let mut state = self.inner.merge_lock.lock();
        let mut map = (**self.inner.addresses.load()).clone();
        for (address, height) in self.inner.store.tracked()? {
            map.entry(address).or_insert(height);
        }
        log::info!("[REGISTRY] started with {} tracked addresses", map.len());

        let unsynced: BTreeSet<ScriptAddress> = map
            .iter()
            .filter(|(a, h)| h.is_none() && !state.in_flight.iter().any(|f| f.addresses.contains(*a)))
            .map(|(a, _)| a.clone())
            .collect();
        self.inner.addresses.store(Arc::new(map));
        self.inner.started.store(true, Ordering::SeqCst);

        if unsynced.is_empty() || self.inner.chain.top_height().is_none() {
            return Ok(());
        }

        let done = Signal::new();
        state.in_flight.push(InFlight {
            id: UNSYNCED_BATCH.to_string(),
            addresses: unsynced.clone(),
            done: done.clone(),
        });
        let job = ScanJob {
            batch_ids: vec![UNSYNCED_BATCH.to_string()],
            addresses: unsynced,
            callbacks: vec![PendingCallback::new(
                UNSYNCED_BATCH.to_string(),
                Box::new(|_: bool| {}),
                Vec::new(),
                done,
            )],
            epoch: self.inner.reorg_epoch.load(Ordering::SeqCst),
        };
        drop(state);

        self.inner.scans_started.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "[REGISTRY] side-scan for {} addresses registered before start",
            job.addresses.len()
        );
        let inner = self.inner.clone();
        std::thread::spawn(move || inner.side_scan(job));
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        log::info!("[REGISTRY] shut down");
    }

    /// Registers one batch. Returns `Ok(true)` when the callback already fired.
    pub fn register_addresses<F>(
        &self,
        addresses: BTreeSet<ScriptAddress>,
        id: impl Into<String>,
        is_new: bool,
        callback: F,
    ) -> Result<bool, RegistryError>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.register_batches(vec![AddressBatch::new(id, addresses, callback)], is_new)
    }

    /// Registers several batches; their unindexed addresses share one side-scan.
    ///
    /// Batch ids must be unique among batches still in flight. An id is free
    /// again once its batch has completed.
    pub fn register_batches(
        &self,
        batches: Vec<AddressBatch>,
        is_new: bool,
    ) -> Result<bool, RegistryError> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(RegistryError::Terminated);
        }
        let mut ids = BTreeSet::new();
        for batch in &batches {
            if batch.addresses.is_empty() {
                return Err(RegistryError::EmptyAddressSet);
            }
            if !ids.insert(batch.id.clone()) {
                return Err(RegistryError::DuplicateBatch(batch.id.clone()));
            }
        }

        let mut state = self.inner.merge_lock.lock();
        if let Some(dup) = batches
            .iter()
            .find(|b| state.in_flight.iter().any(|f| f.id == b.id))
        {
            return Err(RegistryError::DuplicateBatch(dup.id.clone()));
        }

        let registered = self.inner.addresses.load_full();
        let mut to_scan = BTreeSet::new();
        let mut callbacks = Vec::new();
        let mut claims = Vec::new();

        for batch in batches {
            let mut gates: Vec<Signal<bool>> = Vec::new();
            let mut own = BTreeSet::new();

            for address in batch.addresses {
                if let Some(flight) = state.in_flight.iter().find(|f| f.addresses.contains(&address)) {
                    if !gates.iter().any(|g| g.ptr_eq(&flight.done)) {
                        gates.push(flight.done.clone());
                    }
                    continue;
                }
                // Registered but unsynced addresses were never indexed.
                if registered.get(&address).is_some_and(|h| h.is_some()) {
                    continue;
                }
                own.insert(address);
            }

            let done = Signal::new();
            log::debug!(
                "[REGISTRY] batch {}: {} to index, chained behind {} scans",
                batch.id,
                own.len(),
                gates.len()
            );
            if !own.is_empty() {
                to_scan.extend(own.iter().cloned());
                claims.push(InFlight {
                    id: batch.id.clone(),
                    addresses: own,
                    done: done.clone(),
                });
            }
            callbacks.push(PendingCallback::new(batch.id, batch.callback, gates, done));
        }

        let synchronous = callbacks.iter().all(|cb| !cb.is_gated());

        if to_scan.is_empty() {
            drop(state);
            fire_all(callbacks, true);
            return Ok(synchronous);
        }

        let top = self.inner.chain.top_height();
        if !self.inner.started.load(Ordering::SeqCst) || is_new || top.is_none() {
            // Nothing to scan: either no chain yet or no history can exist.
            let height = if self.inner.started.load(Ordering::SeqCst) {
                top
            } else {
                None
            };
            let mut writes = WriteBatch::new();
            for address in &to_scan {
                writes.push(WriteOp::SetSyncHeight {
                    address: address.clone(),
                    height,
                });
            }
            self.inner.store.commit(writes)?;
            self.inner.publish(&to_scan, height);
            drop(state);

            log::info!(
                "[REGISTRY] stamped {} new addresses at height {:?}",
                to_scan.len(),
                height
            );
            fire_all(callbacks, true);
            return Ok(synchronous);
        }

        state.in_flight.extend(claims);
        let job = ScanJob {
            batch_ids: callbacks.iter().map(|cb| cb.id.clone()).collect(),
            addresses: to_scan,
            callbacks,
            epoch: self.inner.reorg_epoch.load(Ordering::SeqCst),
        };
        drop(state);

        self.inner.scans_started.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "[REGISTRY] side-scan for {} addresses (batches {:?})",
            job.addresses.len(),
            job.batch_ids
        );
        let inner = self.inner.clone();
        std::thread::spawn(move || inner.side_scan(job));

        Ok(false)
    }

    /// Applies newly connected blocks to every synced address, and indexes
    /// from genesis the unsynced ones no side-scan is working on.
    pub fn on_new_blocks(&self, reorg: &ReorgState) -> Result<(), RegistryError> {
        let state = self.inner.merge_lock.lock();
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(RegistryError::Terminated);
        }

        if !reorg.previous_top_still_valid {
            self.inner.reorg_epoch.fetch_add(1, Ordering::SeqCst);
            let mut rollback = WriteBatch::new();
            rollback.push(WriteOp::Rollback {
                above: reorg.branch_point,
            });
            self.inner.store.commit(rollback)?;
            log::info!(
                "[REGISTRY] rolled back index above height {}",
                reorg.branch_point
            );
        }

        let registered = self.inner.addresses.load_full();
        let (synced, unsynced): (BTreeSet<ScriptAddress>, BTreeSet<ScriptAddress>) = registered
            .iter()
            .filter(|(a, _)| !state.in_flight.iter().any(|f| f.addresses.contains(*a)))
            .map(|(a, h)| (a.clone(), h.is_some()))
            .fold(Default::default(), |(mut synced, mut unsynced), (a, is_synced)| {
                if is_synced {
                    synced.insert(a);
                } else {
                    unsynced.insert(a);
                }
                (synced, unsynced)
            });

        let scanner = BlockScanner::new(&*self.inner.chain, &*self.inner.store);
        let mut writes = scanner.scan(
            &synced,
            reorg.last_valid_height() + 1,
            reorg.new_top,
            false,
        )?;
        if !unsynced.is_empty() {
            log::info!(
                "[REGISTRY] indexing {} unsynced addresses from genesis",
                unsynced.len()
            );
            writes.append(self.inner.scan_fresh(&unsynced, reorg.new_top)?);
        }
        let indexed: BTreeSet<ScriptAddress> = synced.union(&unsynced).cloned().collect();
        for address in &indexed {
            writes.push(WriteOp::SetSyncHeight {
                address: address.clone(),
                height: Some(reorg.new_top),
            });
        }
        self.inner.store.commit(writes)?;
        self.inner.publish(&indexed, Some(reorg.new_top));
        drop(state);

        log::debug!(
            "[REGISTRY] applied blocks up to {} for {} addresses",
            reorg.new_top,
            indexed.len()
        );
        Ok(())
    }

    /// Stops tracking `addresses` and wipes their index records.
    pub fn unregister_addresses(&self, addresses: &BTreeSet<ScriptAddress>) -> Result<(), RegistryError> {
        let _state = self.inner.merge_lock.lock();
        let mut writes = WriteBatch::new();
        for address in addresses {
            writes.push(WriteOp::Wipe {
                address: address.clone(),
            });
        }
        self.inner.store.commit(writes)?;

        let mut map = (**self.inner.addresses.load()).clone();
        map.retain(|a, _| !addresses.contains(a));
        self.inner.addresses.store(Arc::new(map));
        Ok(())
    }

    pub fn sync_height(&self, address: &ScriptAddress) -> Result<Option<u32>, RegistryError> {
        self.inner
            .addresses
            .load()
            .get(address)
            .copied()
            .ok_or_else(|| RegistryError::UnknownAddress(address.clone()))
    }

    /// Lowest height from which every registered address is indexed.
    pub fn scan_from(&self) -> Option<u32> {
        let map = self.inner.addresses.load();
        map.values().map(|h| h.unwrap_or(0)).min()
    }

    pub fn registered(&self) -> Arc<AddressMap> {
        self.inner.addresses.load_full()
    }

    /// Number of side-scans spawned so far.
    pub fn scan_count(&self) -> usize {
        self.inner.scans_started.load(Ordering::SeqCst)
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.inner.fatal.lock().clone()
    }
}

impl AddressFilter for AddressRegistry {
    fn is_registered(&self, address: &ScriptAddress) -> bool {
        self.inner.addresses.load().contains_key(address)
    }

    fn registered_count(&self) -> usize {
        self.inner.addresses.load().len()
    }
}

fn fire_all(callbacks: Vec<PendingCallback>, success: bool) {
    for cb in callbacks {
        cb.fire(success);
    }
}

// =====================================================================
// Side-scan & merge
// =====================================================================

impl RegistryInner {
    fn publish(&self, addresses: &BTreeSet<ScriptAddress>, height: Option<u32>) {
        let mut map = (**self.addresses.load()).clone();
        for address in addresses {
            map.insert(address.clone(), height);
        }
        self.addresses.store(Arc::new(map));
    }

    fn side_scan(self: Arc<Self>, job: ScanJob) {
        let Some(top) = self.chain.top_height() else {
            self.fail(job, "chain has no blocks".to_string());
            return;
        };

        match self.scan_fresh(&job.addresses, top) {
            Ok(writes) => {
                self.merge_pile.lock().push(ScanResult {
                    job,
                    scanned_to: top,
                    writes,
                });
                self.merge();
            }
            Err(e) => self.fail(job, e.to_string()),
        }
    }

    fn scan_fresh(
        &self,
        addresses: &BTreeSet<ScriptAddress>,
        top: u32,
    ) -> Result<WriteBatch, RegistryError> {
        let mut writes = WriteBatch::new();
        for address in addresses {
            writes.push(WriteOp::Wipe {
                address: address.clone(),
            });
        }
        let scanner = BlockScanner::new(&*self.chain, &*self.store);
        writes.append(scanner.scan(addresses, 0, top, true)?);
        Ok(writes)
    }

    /// Merges every pending scan result. Only one merge runs at a time.
    fn merge(&self) {
        let mut state = self.merge_lock.lock();
        let results: Vec<ScanResult> = std::mem::take(&mut *self.merge_pile.lock());
        let mut completed = Vec::new();

        for result in results {
            let ids = result.job.batch_ids.clone();
            let outcome = if self.terminated.load(Ordering::SeqCst) {
                Err(RegistryError::Terminated)
            } else {
                self.merge_one(&result)
            };

            state.in_flight.retain(|f| !ids.contains(&f.id));
            match outcome {
                Ok(()) => {
                    log::info!(
                        "[REGISTRY] merged {} addresses (batches {:?})",
                        result.job.addresses.len(),
                        ids
                    );
                    completed.push((result.job.callbacks, true));
                }
                Err(e) => {
                    self.record_fatal(&format!("merge of {:?} failed: {}", ids, e));
                    completed.push((result.job.callbacks, false));
                }
            }
        }
        drop(state);

        for (callbacks, success) in completed {
            fire_all(callbacks, success);
        }
    }

    fn merge_one(&self, result: &ScanResult) -> Result<(), RegistryError> {
        let addresses = &result.job.addresses;
        let mut scanned_to = result.scanned_to;

        if result.job.epoch == self.reorg_epoch.load(Ordering::SeqCst) {
            self.store.commit(result.writes.clone())?;
        } else {
            // The chain reorganised under the scan; its writes may cite orphans.
            let top = self.chain.top_height().unwrap_or(0);
            log::warn!("[REGISTRY] reorg during side-scan, rescanning to {}", top);
            self.store.commit(self.scan_fresh(addresses, top)?)?;
            scanned_to = top;
        }

        let top = self.chain.top_height().unwrap_or(scanned_to).max(scanned_to);
        let scanner = BlockScanner::new(&*self.chain, &*self.store);
        let mut writes = scanner.scan(addresses, scanned_to + 1, top, false)?;
        for address in addresses {
            writes.push(WriteOp::SetSyncHeight {
                address: address.clone(),
                height: Some(top),
            });
        }
        self.store.commit(writes)?;
        self.publish(addresses, Some(top));
        Ok(())
    }

    fn fail(&self, job: ScanJob, reason: String) {
        self.record_fatal(&reason);
        {
            let mut state = self.merge_lock.lock();
            state.in_flight.retain(|f| !job.batch_ids.contains(&f.id));
        }
        fire_all(job.callbacks, false);
    }

    fn record_fatal(&self, reason: &str) {
        log::error!("[REGISTRY] fatal: {}", reason);
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(reason.to_string());
        }
    }
}
