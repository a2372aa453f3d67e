//! Transaction transport: fetch raw transactions by id and broadcast new ones.
//!
//! The tracker only depends on [`TxFetcher`]; the Electrum adapter is one
//! implementation, the mock another.

pub mod electrum;
pub mod mock;

#[cfg(test)]
mod tests;

use std::time::Duration;

use bitcoin::Txid;
use bytes::Bytes;

use crate::error::FetchError;

pub use electrum::ElectrumFetcher;
pub use mock::MockFetcher;

pub trait TxFetcher: Send + Sync {
    /// Raw consensus bytes of `txid`, waiting at most `timeout`.
    fn fetch_transaction(&self, txid: &Txid, timeout: Duration) -> Result<Bytes, FetchError>;

    /// Hands `raw` to the network. `Ok` means the peer took it, not that it relayed it.
    fn send_transaction(&self, raw: &[u8], timeout: Duration) -> Result<(), FetchError>;
}
