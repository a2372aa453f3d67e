use bitcoin::Txid;
use thiserror::Error;

use crate::types::ScriptAddress;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("corrupted record: {0}")]
    Corruption(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("block {0} is missing from the main chain")]
    MissingBlock(u32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registration batch contains no addresses")]
    EmptyAddressSet,

    #[error("a registration batch named {0:?} is already in flight")]
    DuplicateBatch(String),

    #[error("registry has been shut down")]
    Terminated,

    #[error("fatal side-scan failure: {0}")]
    Fatal(String),

    #[error("address {0} is not registered")]
    UnknownAddress(ScriptAddress),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("mempool tracking is disabled")]
    Disabled,

    #[error("mempool tracker is shutting down")]
    ShuttingDown,

    #[error("malformed transaction: {0}")]
    Parse(#[from] bitcoin::consensus::encode::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("rejected by peer: {0}")]
    Rejected(String),

    /// The peer does not know the transaction (yet).
    #[error("not known to peer: {0}")]
    NotFound(String),

    #[error("peer disconnected: {0}")]
    Disconnected(String),
}

/// Why a broadcast did not make it into the pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("transaction {txid} rejected: {reason}")]
    Rejected { txid: Txid, reason: String },

    #[error("timed out sending transaction {0}")]
    SendTimeout(Txid),

    #[error("timed out waiting for transaction {0} to be relayed back")]
    ConfirmTimeout(Txid),

    #[error("malformed transaction: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PagerError {
    #[error("history has not been mapped yet")]
    Unmapped,

    #[error("page {0} out of range ({1} pages)")]
    OutOfRange(usize, usize),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Pager(#[from] PagerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("address {0} is not part of this wallet")]
    UnknownAddress(ScriptAddress),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("registration of {0} failed")]
    RegistrationFailed(String),

    #[error("wallet {0} is already loaded")]
    DuplicateWallet(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Mempool(#[from] MempoolError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
