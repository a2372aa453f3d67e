use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::consensus::deserialize;
use bitcoin::{OutPoint, Transaction, Txid};

use crate::chain::ChainSource;
use crate::error::{MempoolError, StoreError};
use crate::store::HistoryStore;
use crate::types::{IoKey, ScriptAddress, TxRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Uninitialized,
    /// Every input points at a known output.
    Resolved,
    /// Some parent is unknown to both the chain and the pool.
    Unresolved,
    /// Accepted with unknown parents; resolved again on the next purge.
    ResolveAgain,
    Mined,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Unresolved,
    /// Confirmed output that pays no indexed address. The index holds no
    /// record of it, so whether a block already spent it is unknown.
    Foreign(IoKey),
    Confirmed {
        key: IoKey,
        address: ScriptAddress,
        value: u64,
    },
    /// Output of another pooled transaction.
    Chained {
        key: IoKey,
        address: ScriptAddress,
        value: u64,
    },
}

impl InputSource {
    pub fn key(&self) -> Option<IoKey> {
        match self {
            InputSource::Unresolved => None,
            InputSource::Foreign(key) => Some(*key),
            InputSource::Confirmed { key, .. } | InputSource::Chained { key, .. } => Some(*key),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, InputSource::Unresolved)
    }

    pub fn is_chained(&self) -> bool {
        matches!(self, InputSource::Chained { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInput {
    pub outpoint: OutPoint,
    pub source: InputSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    pub address: ScriptAddress,
    pub value: u64,
}

/// A pooled (or candidate) unconfirmed transaction with its resolution state.
#[derive(Debug, Clone)]
pub struct ParsedTx {
    pub id: u32,
    pub txid: Txid,
    pub tx: Arc<Transaction>,
    pub inputs: Vec<ParsedInput>,
    pub outputs: Vec<ParsedOutput>,
    pub status: TxStatus,
    pub rbf: bool,
    pub chained: bool,
    /// Unix seconds.
    pub received_at: u64,
}

impl ParsedTx {
    pub fn new(id: u32, tx: Transaction) -> Self {
        let received_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            id,
            txid: tx.compute_txid(),
            inputs: tx
                .input
                .iter()
                .map(|i| ParsedInput {
                    outpoint: i.previous_output,
                    source: InputSource::Unresolved,
                })
                .collect(),
            outputs: tx
                .output
                .iter()
                .map(|o| ParsedOutput {
                    address: ScriptAddress::from_script(&o.script_pubkey),
                    value: o.value.to_sat(),
                })
                .collect(),
            status: TxStatus::Uninitialized,
            rbf: tx.is_explicitly_rbf(),
            chained: false,
            received_at,
            tx: Arc::new(tx),
        }
    }

    pub fn from_bytes(id: u32, raw: &[u8]) -> Result<Self, MempoolError> {
        let tx: Transaction = deserialize(raw)?;
        Ok(Self::new(id, tx))
    }

    pub fn pending_key(&self, vout: u32) -> IoKey {
        IoKey::pending(self.id, vout)
    }

    pub fn is_resolved(&self) -> bool {
        self.inputs.iter().all(|i| i.source.is_resolved())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TxStatus::Mined | TxStatus::Invalid)
    }

    /// Forgets all resolution work, for re-processing after a reorg.
    pub fn reset(&mut self) {
        for input in &mut self.inputs {
            input.source = InputSource::Unresolved;
        }
        self.status = TxStatus::Uninitialized;
        self.chained = false;
        self.rbf = self.tx.is_explicitly_rbf();
    }

    pub fn refresh_status(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.chained = self.inputs.iter().any(|i| i.source.is_chained());
        self.status = if self.is_resolved() {
            TxStatus::Resolved
        } else {
            TxStatus::Unresolved
        };
    }

    /// Resolves inputs against the confirmed index.
    ///
    /// A spend of an output the chain already spent marks the transaction
    /// Invalid. That check only covers indexed outputs: inputs resolving to
    /// [`InputSource::Foreign`] are accepted unchecked.
    ///
    /// Runs on worker threads; touches only read-mostly state.
    pub fn preprocess(
        &mut self,
        chain: &dyn ChainSource,
        store: &dyn HistoryStore,
    ) -> Result<(), StoreError> {
        if self.is_terminal() {
            return Ok(());
        }
        if chain.tx_ref(&self.txid).is_some() {
            log::trace!("[MEMPOOL] {} already mined", self.txid);
            self.status = TxStatus::Mined;
            return Ok(());
        }

        for input in &mut self.inputs {
            if input.source.is_resolved() {
                continue;
            }
            let Some(TxRef::Mined { height, index }) = chain.tx_ref(&input.outpoint.txid) else {
                continue;
            };
            let key = IoKey::mined(height, index, input.outpoint.vout);

            match store.output(&key)? {
                Some(stored) if stored.txio.is_spent() => {
                    log::debug!(
                        "[MEMPOOL] {} spends {} which is already spent on chain",
                        self.txid,
                        key
                    );
                    self.status = TxStatus::Invalid;
                    return Ok(());
                }
                Some(stored) => {
                    input.source = InputSource::Confirmed {
                        key,
                        address: stored.address,
                        value: stored.txio.value,
                    };
                }
                None => input.source = InputSource::Foreign(key),
            }
        }

        self.refresh_status();
        Ok(())
    }
}
