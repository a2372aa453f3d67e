use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::{Transaction, Txid};
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::FetchError;
use crate::fetcher::TxFetcher;

/// Scripted in-memory transport.
///
/// Known transactions are served from a map; everything else times out, or
/// is answered not-found when listed in `not_found`. Broadcasts are recorded;
/// rejected ones fail at send time, the others become fetchable (the network
/// "relays" them back) unless marked silent.
#[derive(Default, Clone)]
pub struct MockFetcher {
    pub known: Arc<Mutex<HashMap<Txid, Bytes>>>,
    pub fetched: Arc<Mutex<Vec<Txid>>>,
    pub sent: Arc<Mutex<Vec<Txid>>>,
    pub rejected: Arc<Mutex<HashSet<Txid>>>,
    /// Broadcasts the peer accepts but never relays back.
    pub silent: Arc<Mutex<HashSet<Txid>>>,
    /// Number of fetches to fail before serving a txid.
    pub flaky: Arc<Mutex<HashMap<Txid, u32>>>,
    /// Txids answered with a not-found error while unknown.
    pub not_found: Arc<Mutex<HashSet<Txid>>>,
    /// Number of fetches answered not-found before a relayed broadcast shows up.
    pub lagging: Arc<Mutex<HashMap<Txid, u32>>>,
    pub offline: Arc<Mutex<bool>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tx: &Transaction) -> Txid {
        let txid = tx.compute_txid();
        self.known.lock().insert(txid, Bytes::from(serialize(tx)));
        txid
    }

    pub fn insert_raw(&self, txid: Txid, raw: Vec<u8>) {
        self.known.lock().insert(txid, Bytes::from(raw));
    }

    pub fn fetch_count(&self, txid: &Txid) -> usize {
        self.fetched.lock().iter().filter(|t| *t == txid).count()
    }
}

impl TxFetcher for MockFetcher {
    fn fetch_transaction(&self, txid: &Txid, _timeout: Duration) -> Result<Bytes, FetchError> {
        self.fetched.lock().push(*txid);
        if let Some(left) = self.flaky.lock().get_mut(txid) {
            if *left > 0 {
                *left -= 1;
                return Err(FetchError::Timeout);
            }
        }
        if let Some(left) = self.lagging.lock().get_mut(txid) {
            if *left > 0 {
                *left -= 1;
                return Err(FetchError::NotFound(format!("{} not in mempool yet", txid)));
            }
        }
        if let Some(raw) = self.known.lock().get(txid).cloned() {
            return Ok(raw);
        }
        if self.not_found.lock().contains(txid) {
            return Err(FetchError::NotFound(format!("no such transaction {}", txid)));
        }
        Err(FetchError::Timeout)
    }

    fn send_transaction(&self, raw: &[u8], _timeout: Duration) -> Result<(), FetchError> {
        if *self.offline.lock() {
            return Err(FetchError::Disconnected("mock offline".into()));
        }
        let tx: Transaction =
            deserialize(raw).map_err(|e| FetchError::Rejected(format!("decode: {}", e)))?;
        let txid = tx.compute_txid();
        self.sent.lock().push(txid);

        if self.rejected.lock().contains(&txid) {
            return Err(FetchError::Rejected("txn-mempool-conflict".into()));
        }
        if self.silent.lock().contains(&txid) {
            return Ok(());
        }
        self.known.lock().insert(txid, Bytes::copy_from_slice(raw));
        Ok(())
    }
}
