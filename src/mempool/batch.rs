use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::FetchError;
use crate::mempool::parsed::ParsedTx;
use crate::sync::Signal;

/// What the serializer reports back for one ingest batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub accepted: Vec<Txid>,
    /// Already pooled, already mined, or paying no registered address.
    pub ignored: Vec<Txid>,
    pub invalid: Vec<Txid>,
    /// Fetch failed after all retries, or the batch deadline passed first.
    pub unfetched: Vec<Txid>,
    /// Pooled transactions evicted by a conflicting member of this batch.
    pub replaced: Vec<Txid>,
}

#[derive(Debug)]
pub(crate) struct BatchEntry {
    pub id: u32,
    pub txid: Txid,
    /// Bytes already in hand (pushed or broadcast); fetched otherwise.
    pub raw: Option<Bytes>,
}

#[derive(Debug)]
pub(crate) enum SlotResult {
    Parsed(ParsedTx),
    Unfetched(FetchError),
    Invalid(String),
}

/// One ingest round: workers fill the slots, the serializer merges them together.
pub(crate) struct ZcBatch {
    pub entries: Vec<BatchEntry>,
    slots: Mutex<Vec<Option<SlotResult>>>,
    remaining: AtomicUsize,
    pub ready: Signal<()>,
    pub timeout: Duration,
    pub completion: Signal<BatchOutcome>,
}

impl ZcBatch {
    pub fn new(entries: Vec<BatchEntry>, timeout: Duration) -> Self {
        let n = entries.len();
        let batch = Self {
            slots: Mutex::new((0..n).map(|_| None).collect()),
            entries,
            remaining: AtomicUsize::new(n),
            ready: Signal::new(),
            timeout,
            completion: Signal::new(),
        };
        if n == 0 {
            batch.ready.set(());
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn fill(&self, slot: usize, result: SlotResult) {
        if let Some(s) = self.slots.lock().get_mut(slot) {
            *s = Some(result);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.ready.set(());
        }
    }

    /// Hands every filled slot over to the merge. Late fills are discarded.
    pub fn take_results(&self) -> Vec<Option<SlotResult>> {
        std::mem::take(&mut *self.slots.lock())
    }

    /// How long the serializer waits for the workers before merging what it has.
    pub fn deadline(&self, workers: usize, retries: u32) -> Duration {
        let rounds = self.len().div_ceil(workers.max(1)) as u32;
        self.timeout * (retries + 1) * rounds.max(1) + Duration::from_secs(1)
    }
}

/// Caller side of an ingest batch.
pub struct BatchHandle {
    pub(crate) batch: Arc<ZcBatch>,
    pub(crate) running: Arc<AtomicBool>,
}

impl BatchHandle {
    pub fn txids(&self) -> Vec<Txid> {
        self.batch.entries.iter().map(|e| e.txid).collect()
    }

    /// Blocks until the batch is merged. `None` if the tracker shut down first.
    pub fn wait(&self) -> Option<BatchOutcome> {
        loop {
            if let Some(outcome) = self.batch.completion.wait_timeout(Duration::from_millis(100)) {
                return Some(outcome);
            }
            if !self.running.load(Ordering::Acquire) {
                return self.batch.completion.peek();
            }
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<BatchOutcome> {
        self.batch.completion.wait_timeout(timeout)
    }

    pub fn is_complete(&self) -> bool {
        self.batch.completion.is_set()
    }
}
