//! Zero-confirmation transaction tracker.
//!
//! # Architecture
//! * **Workers**: a fixed pool pops fetch jobs, downloads and parses the raw
//!   transaction and resolves its inputs against the confirmed index.
//! * **Serializer**: a single thread owns every pool mutation. It waits for a
//!   batch's workers (bounded), merges the batch into a private copy of the
//!   snapshot, installs it and notifies subscribers.
//! * **Readers**: go through [`MempoolView`] and never lock.

mod batch;
mod logic;
mod parsed;
mod state;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bitcoin::consensus::deserialize;
use bitcoin::hashes::Hash;
use bitcoin::{Transaction, Txid};
use bytes::Bytes;
use parking_lot::Mutex;

use crate::chain::ChainSource;
use crate::config::IndexConfig;
use crate::error::{BroadcastError, FetchError, MempoolError};
use crate::fetcher::TxFetcher;
use crate::notify::{MempoolNotification, MempoolSubscriber, Subscribers, TxIoMap};
use crate::registry::AddressFilter;
use crate::store::HistoryStore;
use crate::sync::{BlockingQueue, Signal};
use crate::types::{IoKey, ReorgState, ScriptAddress, TxIoPair};

pub use batch::{BatchHandle, BatchOutcome};
pub use parsed::{InputSource, ParsedInput, ParsedOutput, ParsedTx, TxStatus};
pub use state::{MempoolView, PoolSnapshot};

use batch::{BatchEntry, SlotResult, ZcBatch};
use logic::{invalidate_with_descendants, merge_transactions, plan_purge};

/// What a purge took out of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Every pending id that left the pool, mined ones included.
    pub invalidated: BTreeSet<u32>,
    pub mined: BTreeSet<u32>,
    /// Pending output key -> confirmed key, for outputs whose spender was grafted.
    pub mined_keys: BTreeMap<IoKey, IoKey>,
}

struct FetchJob {
    batch: Arc<ZcBatch>,
    slot: usize,
}

enum Action {
    Merge(Arc<ZcBatch>),
    Purge {
        reorg: ReorgState,
        reply: Signal<PurgeOutcome>,
    },
    Drop {
        txids: Vec<Txid>,
        reply: Signal<Vec<Txid>>,
    },
}

struct TrackerInner {
    config: IndexConfig,
    store: Arc<dyn HistoryStore>,
    chain: Arc<dyn ChainSource>,
    fetcher: Arc<dyn TxFetcher>,
    filter: Arc<dyn AddressFilter>,

    view: MempoolView,
    subscribers: Subscribers,

    work: BlockingQueue<FetchJob>,
    actions: BlockingQueue<Action>,

    next_id: AtomicU32,
    running: Arc<AtomicBool>,
}

pub struct MempoolTracker {
    inner: Arc<TrackerInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MempoolTracker {
    /// Spawns the worker pool and the serializer. A disabled tracker spawns nothing.
    pub fn new(
        config: IndexConfig,
        store: Arc<dyn HistoryStore>,
        chain: Arc<dyn ChainSource>,
        fetcher: Arc<dyn TxFetcher>,
        filter: Arc<dyn AddressFilter>,
    ) -> Self {
        let enabled = config.mempool_enabled;
        let workers = config.worker_threads.max(1);
        let inner = Arc::new(TrackerInner {
            config,
            store,
            chain,
            fetcher,
            filter,
            view: MempoolView::default(),
            subscribers: Subscribers::default(),
            work: BlockingQueue::new(),
            actions: BlockingQueue::new(),
            next_id: AtomicU32::new(1),
            running: Arc::new(AtomicBool::new(enabled)),
        });

        let mut threads = Vec::new();
        if enabled {
            for n in 0..workers {
                let inner = inner.clone();
                threads.push(
                    std::thread::Builder::new()
                        .name(format!("zc-worker-{}", n))
                        .spawn(move || inner.run_worker()),
                );
            }
            let serializer = inner.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("zc-serializer".into())
                    .spawn(move || serializer.run_serializer()),
            );
        }

        let threads: Vec<JoinHandle<()>> = threads
            .into_iter()
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("[MEMPOOL] cannot spawn thread: {}", e);
                    None
                }
            })
            .collect();

        log::info!(
            "[MEMPOOL] tracker started (enabled={}, workers={})",
            enabled,
            workers
        );
        Self {
            inner,
            threads: Mutex::new(threads),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.mempool_enabled
    }

    pub fn view(&self) -> MempoolView {
        self.inner.view.clone()
    }

    pub fn add_subscriber(&self, id: impl Into<String>, subscriber: Arc<dyn MempoolSubscriber>) {
        self.inner.subscribers.insert(id.into(), subscriber);
    }

    pub fn remove_subscriber(&self, id: &str) -> bool {
        self.inner.subscribers.remove(id)
    }

    /// Queues announced txids for fetching.
    ///
    /// Returns `None` when there is nothing to do: tracking is off, no address
    /// is registered, or every txid is already pooled.
    pub fn process_inventory(&self, txids: &[Txid], timeout: Duration) -> Option<BatchHandle> {
        let inner = &self.inner;
        if !inner.config.mempool_enabled || !inner.is_running() {
            return None;
        }
        if inner.filter.registered_count() == 0 {
            log::trace!("[MEMPOOL] no registered address, skipping {} txids", txids.len());
            return None;
        }

        let snapshot = inner.view.load();
        let mut seen = BTreeSet::new();
        let entries: Vec<BatchEntry> = txids
            .iter()
            .filter(|txid| !snapshot.contains(txid) && seen.insert(**txid))
            .map(|txid| BatchEntry {
                id: inner.next_id(),
                txid: *txid,
                raw: None,
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        inner.submit(entries, timeout)
    }

    /// Ingests a transaction whose bytes are already in hand.
    pub fn push_raw_transaction(&self, raw: &[u8]) -> Result<BatchHandle, MempoolError> {
        let inner = &self.inner;
        if !inner.config.mempool_enabled {
            return Err(MempoolError::Disabled);
        }
        if !inner.is_running() {
            return Err(MempoolError::ShuttingDown);
        }

        let tx: Transaction = deserialize(raw)?;
        let entry = BatchEntry {
            id: inner.next_id(),
            txid: tx.compute_txid(),
            raw: Some(Bytes::copy_from_slice(raw)),
        };
        inner
            .submit(vec![entry], inner.config.fetch_timeout())
            .ok_or(MempoolError::ShuttingDown)
    }

    /// Sends `raw` to the network and waits for it to come back before pooling it.
    ///
    /// On failure the subscriber named `requester` gets an `on_error`.
    pub fn broadcast(
        &self,
        raw: &[u8],
        timeout: Duration,
        requester: Option<&str>,
    ) -> Result<Txid, BroadcastError> {
        let result = self.try_broadcast(raw, timeout);
        if let Err(e) = &result {
            log::warn!("[MEMPOOL] broadcast failed: {}", e);
            if let Some(id) = requester {
                let txid = match e {
                    BroadcastError::Rejected { txid, .. }
                    | BroadcastError::SendTimeout(txid)
                    | BroadcastError::ConfirmTimeout(txid) => *txid,
                    BroadcastError::Malformed(_) => Txid::all_zeros(),
                };
                self.inner.subscribers.error(id, &e.to_string(), &txid);
            }
        }
        result
    }

    fn try_broadcast(&self, raw: &[u8], timeout: Duration) -> Result<Txid, BroadcastError> {
        let tx: Transaction =
            deserialize(raw).map_err(|e| BroadcastError::Malformed(e.to_string()))?;
        let txid = tx.compute_txid();
        let fetcher = &self.inner.fetcher;

        match fetcher.send_transaction(raw, timeout) {
            Ok(()) => {}
            Err(FetchError::Rejected(reason)) => return Err(BroadcastError::Rejected { txid, reason }),
            Err(_) => return Err(BroadcastError::SendTimeout(txid)),
        }

        // The peer relaying the transaction back is the acceptance proof.
        // Until it shows up the peer answers not-found; only the deadline
        // turns that into a failure.
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(BroadcastError::ConfirmTimeout(txid));
            }
            match fetcher.fetch_transaction(&txid, left) {
                Ok(_) => break,
                Err(FetchError::NotFound(_) | FetchError::Timeout) => {
                    log::trace!("[MEMPOOL] {} not relayed back yet", txid);
                    std::thread::sleep(left.min(Duration::from_millis(50)));
                }
                Err(e) => {
                    log::debug!("[MEMPOOL] fetch-back of {} failed: {}", txid, e);
                    return Err(BroadcastError::ConfirmTimeout(txid));
                }
            }
        }
        log::info!("[MEMPOOL] broadcast {} accepted by peer", txid);

        if !self.is_enabled() {
            return Ok(txid);
        }
        let handle = self
            .push_raw_transaction(raw)
            .map_err(|e| BroadcastError::Malformed(e.to_string()))?;
        match handle.wait_timeout(timeout) {
            Some(outcome) if outcome.invalid.contains(&txid) => Err(BroadcastError::Rejected {
                txid,
                reason: "conflicts with the confirmed index".into(),
            }),
            Some(_) => Ok(txid),
            None => {
                log::debug!("[MEMPOOL] {} relayed, merge still pending", txid);
                Ok(txid)
            }
        }
    }

    /// Drops pooled transactions mined or orphaned by a chain-tip change.
    pub fn purge(&self, reorg: &ReorgState) -> Result<PurgeOutcome, MempoolError> {
        if !self.is_enabled() {
            return Ok(PurgeOutcome::default());
        }
        let reply = Signal::new();
        self.inner.call(
            Action::Purge {
                reorg: *reorg,
                reply: reply.clone(),
            },
            &reply,
        )
    }

    /// Removes transactions and their descendants. Returns every txid removed.
    pub fn drop_transactions(&self, txids: &[Txid]) -> Result<Vec<Txid>, MempoolError> {
        if !self.is_enabled() {
            return Err(MempoolError::Disabled);
        }
        let reply = Signal::new();
        self.inner.call(
            Action::Drop {
                txids: txids.to_vec(),
                reply: reply.clone(),
            },
            &reply,
        )
    }

    pub fn get_transaction(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.inner.view.get_transaction(txid)
    }

    pub fn has_transaction(&self, txid: &Txid) -> bool {
        self.inner.view.has_transaction(txid)
    }

    pub fn is_output_spent(&self, key: &IoKey) -> bool {
        self.inner.view.is_output_spent(key)
    }

    pub fn txios_for(&self, address: &ScriptAddress) -> Option<Arc<TxIoMap>> {
        self.inner.view.txios_for(address)
    }

    pub fn unspent_for(&self, address: &ScriptAddress) -> Vec<TxIoPair> {
        self.inner.view.unspent_for(address)
    }

    pub fn rbf_txios_for(&self, address: &ScriptAddress) -> Vec<TxIoPair> {
        self.inner.view.rbf_txios_for(address)
    }

    /// Stops the threads and waits for them. In-flight fetches are abandoned.
    pub fn shutdown(&self) {
        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        if !self.inner.running.swap(false, Ordering::AcqRel) && threads.is_empty() {
            return;
        }
        self.inner.work.terminate();
        self.inner.actions.terminate();
        for handle in threads {
            if handle.join().is_err() {
                log::error!("[MEMPOOL] a tracker thread panicked");
            }
        }
        log::info!("[MEMPOOL] tracker stopped");
    }
}

impl Drop for MempoolTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =====================================================================
// Threads
// =====================================================================

impl TrackerInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, entries: Vec<BatchEntry>, timeout: Duration) -> Option<BatchHandle> {
        let batch = Arc::new(ZcBatch::new(entries, timeout));
        // The merge is queued first so batches merge in submission order.
        if !self.actions.push(Action::Merge(batch.clone())) {
            return None;
        }
        for slot in 0..batch.len() {
            self.work.push(FetchJob {
                batch: batch.clone(),
                slot,
            });
        }
        log::debug!("[MEMPOOL] queued batch of {} transactions", batch.len());
        Some(BatchHandle {
            batch,
            running: self.running.clone(),
        })
    }

    /// Queues `action` and waits for the serializer's answer.
    fn call<T: Clone>(&self, action: Action, reply: &Signal<T>) -> Result<T, MempoolError> {
        if !self.is_running() || !self.actions.push(action) {
            return Err(MempoolError::ShuttingDown);
        }
        loop {
            if let Some(value) = reply.wait_timeout(Duration::from_millis(100)) {
                return Ok(value);
            }
            if !self.is_running() {
                return reply.peek().ok_or(MempoolError::ShuttingDown);
            }
        }
    }

    fn run_worker(&self) {
        while let Some(job) = self.work.pop() {
            // Merged already (deadline passed); nobody will read the slot.
            if job.batch.completion.is_set() {
                continue;
            }
            let result = self.process_entry(&job.batch.entries[job.slot], job.batch.timeout);
            job.batch.fill(job.slot, result);
        }
    }

    fn fetch_with_retries(&self, txid: &Txid, timeout: Duration) -> Result<Bytes, FetchError> {
        let attempts = self.config.fetch_retries + 1;
        let mut last = FetchError::Timeout;
        for attempt in 1..=attempts {
            match self.fetcher.fetch_transaction(txid, timeout) {
                Ok(raw) => return Ok(raw),
                Err(e) => {
                    log::debug!("[MEMPOOL] fetch {} attempt {}/{} failed: {}", txid, attempt, attempts, e);
                    last = e;
                }
            }
            if !self.is_running() {
                break;
            }
        }
        Err(last)
    }

    fn process_entry(&self, entry: &BatchEntry, timeout: Duration) -> SlotResult {
        let raw = match &entry.raw {
            Some(raw) => raw.clone(),
            None => match self.fetch_with_retries(&entry.txid, timeout) {
                Ok(raw) => raw,
                Err(e) => return SlotResult::Unfetched(e),
            },
        };

        let mut tx = match ParsedTx::from_bytes(entry.id, &raw) {
            Ok(tx) => tx,
            Err(e) => {
                log::warn!("[MEMPOOL] {} is malformed: {}", entry.txid, e);
                return SlotResult::Invalid(e.to_string());
            }
        };
        if tx.txid != entry.txid {
            log::warn!("[MEMPOOL] peer answered {} with {}", entry.txid, tx.txid);
            return SlotResult::Invalid("txid mismatch".into());
        }
        if let Err(e) = tx.preprocess(self.chain.as_ref(), self.store.as_ref()) {
            log::warn!("[MEMPOOL] cannot resolve {}: {}", entry.txid, e);
            return SlotResult::Invalid(e.to_string());
        }
        SlotResult::Parsed(tx)
    }

    fn run_serializer(&self) {
        while let Some(action) = self.actions.pop() {
            match action {
                Action::Merge(batch) => self.merge_batch(&batch),
                Action::Purge { reorg, reply } => {
                    reply.set(self.purge_now(&reorg));
                }
                Action::Drop { txids, reply } => {
                    reply.set(self.drop_now(&txids));
                }
            }
        }
    }

    // =====================================================================
    // Serializer actions
    // =====================================================================

    fn merge_batch(&self, batch: &ZcBatch) {
        let deadline =
            Instant::now() + batch.deadline(self.config.worker_threads, self.config.fetch_retries);
        loop {
            if !self.is_running() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("[MEMPOOL] batch deadline passed, merging partial results");
                break;
            }
            let slice = (deadline - now).min(Duration::from_millis(100));
            if batch.ready.wait_timeout(slice).is_some() {
                break;
            }
        }

        let mut outcome = BatchOutcome::default();
        let mut candidates = Vec::new();
        for (entry, slot) in batch.entries.iter().zip(batch.take_results()) {
            match slot {
                Some(SlotResult::Parsed(tx)) => candidates.push(tx),
                Some(SlotResult::Invalid(_)) => outcome.invalid.push(entry.txid),
                Some(SlotResult::Unfetched(_)) | None => outcome.unfetched.push(entry.txid),
            }
        }

        let mut state = (*self.view.load()).clone();
        let report = merge_transactions(&mut state, candidates, self.filter.as_ref());
        let snapshot = Arc::new(state);
        self.view.install(snapshot.clone());

        log::debug!(
            "[MEMPOOL] merged batch: {} accepted, {} ignored, {} invalid, {} unfetched, {} replaced",
            report.accepted.len(),
            report.ignored.len(),
            report.invalid.len(),
            outcome.unfetched.len(),
            report.replaced.len()
        );

        self.notify(
            &snapshot,
            report.affected,
            report.replaced.keys().copied().collect(),
            BTreeMap::new(),
        );

        outcome.accepted = report.accepted;
        outcome.ignored = report.ignored;
        outcome.invalid.extend(report.invalid);
        outcome.replaced = report.replaced.into_values().collect();
        batch.completion.set(outcome);
    }

    fn purge_now(&self, reorg: &ReorgState) -> PurgeOutcome {
        let old = self.view.load();
        if old.is_empty() {
            return PurgeOutcome::default();
        }

        let start = reorg.last_valid_height() + 1;
        let plan = plan_purge(&old, self.chain.as_ref(), start, reorg.new_top);

        let mut survivors = plan.survivors;
        for tx in &mut survivors {
            if !reorg.previous_top_still_valid {
                tx.reset();
            }
            if let Err(e) = tx.preprocess(self.chain.as_ref(), self.store.as_ref()) {
                log::warn!("[MEMPOOL] dropping {} after purge: {}", tx.txid, e);
                tx.status = TxStatus::Invalid;
            }
        }

        let mut fresh = PoolSnapshot::default();
        merge_transactions(&mut fresh, survivors, self.filter.as_ref());

        let invalidated: BTreeSet<u32> = old
            .txs
            .keys()
            .filter(|id| !fresh.txs.contains_key(id))
            .copied()
            .collect();
        let affected: BTreeSet<ScriptAddress> = old
            .txios
            .keys()
            .chain(fresh.txios.keys())
            .filter(|a| old.txios.get(*a).map(|m| &**m) != fresh.txios.get(*a).map(|m| &**m))
            .cloned()
            .collect();

        log::info!(
            "[MEMPOOL] purge {}..={}: {} mined, {} conflicted, {} left the pool",
            start,
            reorg.new_top,
            plan.mined.len(),
            plan.conflicted.len(),
            invalidated.len()
        );

        let snapshot = Arc::new(fresh);
        self.view.install(snapshot.clone());
        self.notify(&snapshot, affected, invalidated.clone(), plan.mined_keys.clone());

        PurgeOutcome {
            invalidated,
            mined: plan.mined,
            mined_keys: plan.mined_keys,
        }
    }

    fn drop_now(&self, txids: &[Txid]) -> Vec<Txid> {
        let mut state = (*self.view.load()).clone();
        let mut affected = BTreeSet::new();
        let mut dropped = BTreeMap::new();

        for txid in txids {
            let Some(id) = state.by_hash.get(txid).copied() else {
                continue;
            };
            dropped.extend(invalidate_with_descendants(&mut state, id, &mut affected));
        }
        if dropped.is_empty() {
            return Vec::new();
        }

        let snapshot = Arc::new(state);
        self.view.install(snapshot.clone());
        self.notify(&snapshot, affected, dropped.keys().copied().collect(), BTreeMap::new());
        log::debug!("[MEMPOOL] dropped {} transactions", dropped.len());
        dropped.into_values().collect()
    }

    fn notify(
        &self,
        snapshot: &PoolSnapshot,
        affected: BTreeSet<ScriptAddress>,
        invalidated: BTreeSet<u32>,
        mined_keys: BTreeMap<IoKey, IoKey>,
    ) {
        let txios = affected
            .into_iter()
            .map(|address| {
                let map = snapshot.txios_for(&address).unwrap_or_default();
                (address, map)
            })
            .collect();
        let notification = MempoolNotification {
            txios,
            invalidated,
            mined_keys,
        };
        if !notification.is_empty() {
            self.subscribers.publish(&notification);
        }
    }
}
