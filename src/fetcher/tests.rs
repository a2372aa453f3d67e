use std::time::Duration;

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::Transaction;

use crate::error::FetchError;
use crate::fetcher::{MockFetcher, TxFetcher};
use crate::testing::{address, coinbase};

const T: Duration = Duration::from_millis(50);

#[test]
fn test_mock_serves_known_transactions() {
    let fetcher = MockFetcher::new();
    let tx = coinbase(&[(address(1), 1_000)]);
    let txid = fetcher.insert(&tx);

    let raw = fetcher.fetch_transaction(&txid, T).unwrap();
    let decoded: Transaction = deserialize(&raw).unwrap();
    assert_eq!(decoded.compute_txid(), txid);
    assert_eq!(fetcher.fetch_count(&txid), 1);
}

#[test]
fn test_mock_unknown_times_out() {
    let fetcher = MockFetcher::new();
    let txid = coinbase(&[(address(1), 1_000)]).compute_txid();
    assert_eq!(fetcher.fetch_transaction(&txid, T), Err(FetchError::Timeout));
}

#[test]
fn test_mock_flaky_recovers() {
    let fetcher = MockFetcher::new();
    let tx = coinbase(&[(address(1), 1_000)]);
    let txid = fetcher.insert(&tx);
    fetcher.flaky.lock().insert(txid, 2);

    assert_eq!(fetcher.fetch_transaction(&txid, T), Err(FetchError::Timeout));
    assert_eq!(fetcher.fetch_transaction(&txid, T), Err(FetchError::Timeout));
    assert!(fetcher.fetch_transaction(&txid, T).is_ok());
    assert_eq!(fetcher.fetch_count(&txid), 3);
}

#[test]
fn test_mock_broadcast_relays_back() {
    let fetcher = MockFetcher::new();
    let tx = coinbase(&[(address(2), 5_000)]);
    let txid = tx.compute_txid();

    fetcher.send_transaction(&serialize(&tx), T).unwrap();
    assert_eq!(fetcher.sent.lock().as_slice(), &[txid]);
    assert!(fetcher.fetch_transaction(&txid, T).is_ok());
}

#[test]
fn test_mock_rejected_and_silent_broadcasts() {
    let fetcher = MockFetcher::new();
    let rejected = coinbase(&[(address(3), 1)]);
    let silent = coinbase(&[(address(4), 1)]);
    fetcher.rejected.lock().insert(rejected.compute_txid());
    fetcher.silent.lock().insert(silent.compute_txid());

    assert!(matches!(
        fetcher.send_transaction(&serialize(&rejected), T),
        Err(FetchError::Rejected(_))
    ));
    fetcher.send_transaction(&serialize(&silent), T).unwrap();

    assert_eq!(
        fetcher.fetch_transaction(&silent.compute_txid(), T),
        Err(FetchError::Timeout)
    );
    fetcher.not_found.lock().insert(silent.compute_txid());
    assert!(matches!(
        fetcher.fetch_transaction(&silent.compute_txid(), T),
        Err(FetchError::NotFound(_))
    ));
}

#[test]
fn test_mock_lagging_relay_answers_not_found_first() {
    let fetcher = MockFetcher::new();
    let tx = coinbase(&[(address(6), 1)]);
    let txid = tx.compute_txid();
    fetcher.lagging.lock().insert(txid, 1);

    fetcher.send_transaction(&serialize(&tx), T).unwrap();
    assert!(matches!(
        fetcher.fetch_transaction(&txid, T),
        Err(FetchError::NotFound(_))
    ));
    assert!(fetcher.fetch_transaction(&txid, T).is_ok());
}

#[test]
fn test_mock_offline_refuses_broadcast() {
    let fetcher = MockFetcher::new();
    *fetcher.offline.lock() = true;
    let tx = coinbase(&[(address(5), 1)]);
    assert!(matches!(
        fetcher.send_transaction(&serialize(&tx), T),
        Err(FetchError::Disconnected(_))
    ));
    assert!(fetcher.sent.lock().is_empty());
}
