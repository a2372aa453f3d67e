pub mod chain;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod ledger;
pub mod mempool;
pub mod notify;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod store;
pub mod sync;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::IndexConfig;
pub use service::IndexService;
pub use types::{IoKey, ReorgState, ScriptAddress, TxIoPair, TxRef};
