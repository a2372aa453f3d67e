//! Subscriber contract for mempool changes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bitcoin::Txid;
use parking_lot::RwLock;

use crate::types::{IoKey, ScriptAddress, TxIoPair};

/// Per-address pending txios, as held by the mempool snapshot.
pub type TxIoMap = BTreeMap<IoKey, TxIoPair>;

/// Delta pushed to subscribers after a merge or a purge.
#[derive(Debug, Clone, Default)]
pub struct MempoolNotification {
    /// Current pending txios of every affected address the subscriber follows.
    /// An empty map means the address no longer has pending activity.
    pub txios: BTreeMap<ScriptAddress, Arc<TxIoMap>>,
    /// Pending transaction ids that left the pool.
    pub invalidated: BTreeSet<u32>,
    /// Pending output keys rewritten to their confirmed key by a graft.
    pub mined_keys: BTreeMap<IoKey, IoKey>,
}

impl MempoolNotification {
    pub fn is_empty(&self) -> bool {
        self.txios.is_empty()
    }
}

/// A consumer of mempool updates (one per connected viewer or wallet set).
pub trait MempoolSubscriber: Send + Sync {
    fn address_filter(&self, address: &ScriptAddress) -> bool;

    fn on_new_mempool_txio(&self, notification: &MempoolNotification);

    fn on_error(&self, message: &str, txid: &Txid);
}

#[derive(Default)]
pub(crate) struct Subscribers {
    inner: RwLock<BTreeMap<String, Arc<dyn MempoolSubscriber>>>,
}

impl Subscribers {
    pub fn insert(&self, id: String, subscriber: Arc<dyn MempoolSubscriber>) {
        self.inner.write().insert(id, subscriber);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.inner.write().remove(id).is_some()
    }

    /// Sends each subscriber the slice of `update` it follows.
    pub fn publish(&self, update: &MempoolNotification) {
        let subscribers: Vec<(String, Arc<dyn MempoolSubscriber>)> = self
            .inner
            .read()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        for (id, subscriber) in subscribers {
            let txios: BTreeMap<ScriptAddress, Arc<TxIoMap>> = update
                .txios
                .iter()
                .filter(|(address, _)| subscriber.address_filter(address))
                .map(|(a, m)| (a.clone(), m.clone()))
                .collect();
            if txios.is_empty() {
                continue;
            }

            log::trace!("[MEMPOOL] notifying {} about {} addresses", id, txios.len());
            subscriber.on_new_mempool_txio(&MempoolNotification {
                txios,
                invalidated: update.invalidated.clone(),
                mined_keys: update.mined_keys.clone(),
            });
        }
    }

    pub fn error(&self, id: &str, message: &str, txid: &Txid) {
        let subscriber = self.inner.read().get(id).cloned();
        match subscriber {
            Some(s) => s.on_error(message, txid),
            None => log::debug!("[MEMPOOL] error for unknown subscriber {}: {}", id, message),
        }
    }
}
