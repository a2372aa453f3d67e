use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::consensus::serialize;
use bitcoin::{Transaction, Txid};
use parking_lot::Mutex;

use crate::chain::MemoryChain;
use crate::config::IndexConfig;
use crate::error::{BroadcastError, MempoolError};
use crate::fetcher::MockFetcher;
use crate::mempool::{BatchOutcome, InputSource, MempoolTracker, PurgeOutcome};
use crate::notify::{MempoolNotification, MempoolSubscriber};
use crate::registry::AddressRegistry;
use crate::store::MemoryStore;
use crate::sync::Signal;
use crate::testing::*;
use crate::types::{IoKey, ReorgState, ScriptAddress};

const WAIT: Duration = Duration::from_secs(5);

// =========================================================================
// Helpers
// =========================================================================

#[derive(Default)]
struct Recorder {
    notifications: Mutex<Vec<MempoolNotification>>,
    errors: Mutex<Vec<(String, Txid)>>,
}

impl MempoolSubscriber for Recorder {
    fn address_filter(&self, _address: &ScriptAddress) -> bool {
        true
    }

    fn on_new_mempool_txio(&self, notification: &MempoolNotification) {
        self.notifications.lock().push(notification.clone());
    }

    fn on_error(&self, message: &str, txid: &Txid) {
        self.errors.lock().push((message.to_string(), *txid));
    }
}

struct Fixture {
    chain: Arc<MemoryChain>,
    registry: AddressRegistry,
    fetcher: MockFetcher,
    tracker: MempoolTracker,
    recorder: Arc<Recorder>,
    /// Coinbase at height 0 paying 10_000 to address 1.
    fund: Transaction,
}

fn test_config() -> IndexConfig {
    IndexConfig {
        worker_threads: 2,
        fetch_timeout_ms: 50,
        fetch_retries: 1,
        broadcast_timeout_ms: 500,
        ..IndexConfig::default()
    }
}

fn fixture_with(config: IndexConfig) -> Fixture {
    init_logs();
    let chain = Arc::new(MemoryChain::new());
    let fund = coinbase(&[(address(1), 10_000)]);
    chain.push_block(block(vec![fund.clone()]));

    let store = Arc::new(MemoryStore::new());
    let registry = AddressRegistry::new(store.clone(), chain.clone());
    registry.start().unwrap();

    let done = Signal::new();
    let cb = done.clone();
    let history: BTreeSet<_> = [address(1)].into_iter().collect();
    registry
        .register_addresses(history, "history", false, move |ok| {
            cb.set(ok);
        })
        .unwrap();
    assert_eq!(done.wait_timeout(WAIT), Some(true));

    let fresh: BTreeSet<_> = [2, 3, 4].into_iter().map(address).collect();
    registry.register_addresses(fresh, "fresh", true, |_| {}).unwrap();

    let fetcher = MockFetcher::new();
    let tracker = MempoolTracker::new(
        config,
        store,
        chain.clone(),
        Arc::new(fetcher.clone()),
        Arc::new(registry.clone()),
    );
    let recorder = Arc::new(Recorder::default());
    tracker.add_subscriber("viewer", recorder.clone());

    Fixture {
        chain,
        registry,
        fetcher,
        tracker,
        recorder,
        fund,
    }
}

fn fixture() -> Fixture {
    fixture_with(test_config())
}

impl Fixture {
    fn ingest(&self, txs: &[&Transaction]) -> BatchOutcome {
        let txids: Vec<Txid> = txs.iter().map(|tx| self.fetcher.insert(tx)).collect();
        self.tracker
            .process_inventory(&txids, Duration::from_millis(50))
            .expect("batch queued")
            .wait_timeout(WAIT)
            .expect("batch merged")
    }

    fn new_blocks(&self, reorg: ReorgState) -> PurgeOutcome {
        self.registry.on_new_blocks(&reorg).unwrap();
        self.tracker.purge(&reorg).unwrap()
    }

    fn id_of(&self, txid: &Txid) -> u32 {
        *self.tracker.view().load().by_hash.get(txid).expect("pooled")
    }
}

// =========================================================================
// Ingest
// =========================================================================

#[test]
fn test_inventory_accepts_relevant_and_ignores_foreign() {
    let fx = fixture();
    let pay = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let foreign = coinbase(&[(address(9), 5_000)]);

    let outcome = fx.ingest(&[&pay, &foreign]);

    assert_eq!(outcome.accepted, vec![pay.compute_txid()]);
    assert_eq!(outcome.ignored, vec![foreign.compute_txid()]);
    assert!(fx.tracker.has_transaction(&pay.compute_txid()));
    assert!(!fx.tracker.has_transaction(&foreign.compute_txid()));
    assert!(fx.tracker.is_output_spent(&IoKey::mined(0, 0, 0)));

    let spent = fx.tracker.txios_for(&address(1)).unwrap();
    let txio = spent.get(&IoKey::mined(0, 0, 0)).unwrap();
    assert_eq!(txio.input_txid, Some(pay.compute_txid()));
    assert_eq!(fx.tracker.unspent_for(&address(2)).len(), 1);

    let notes = fx.recorder.notifications.lock();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].txios.contains_key(&address(1)));
    assert!(notes[0].txios.contains_key(&address(2)));
}

#[test]
fn test_pooled_txids_are_not_fetched_again() {
    let fx = fixture();
    let pay = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    fx.ingest(&[&pay]);

    let txid = pay.compute_txid();
    assert!(fx
        .tracker
        .process_inventory(&[txid, txid], Duration::from_millis(50))
        .is_none());
    assert_eq!(fx.fetcher.fetch_count(&txid), 1);
}

#[test]
fn test_child_in_same_batch_is_chained() {
    let fx = fixture();
    let parent = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let child = spend(&[outpoint(&parent, 0)], &[(address(3), 8_000)]);

    let outcome = fx.ingest(&[&parent, &child]);
    assert_eq!(outcome.accepted.len(), 2);

    let parent_key = IoKey::pending(fx.id_of(&parent.compute_txid()), 0);
    let at_two = fx.tracker.txios_for(&address(2)).unwrap();
    let txio = at_two.get(&parent_key).unwrap();
    assert_eq!(txio.input_txid, Some(child.compute_txid()));
    assert!(txio.flags.chained);

    let at_three = fx.tracker.txios_for(&address(3)).unwrap();
    assert!(at_three.values().all(|t| t.flags.chained));
    assert!(fx.tracker.unspent_for(&address(2)).is_empty());
}

#[test]
fn test_child_listed_before_parent_in_batch_is_chained() {
    let fx = fixture();
    let parent = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let child = spend(&[outpoint(&parent, 0)], &[(address(9), 8_000)]);

    let outcome = fx.ingest(&[&child, &parent]);
    assert_eq!(outcome.accepted, vec![parent.compute_txid(), child.compute_txid()]);
    assert!(outcome.ignored.is_empty());

    let parent_key = IoKey::pending(fx.id_of(&parent.compute_txid()), 0);
    let at_two = fx.tracker.txios_for(&address(2)).unwrap();
    let txio = at_two.get(&parent_key).unwrap();
    assert_eq!(txio.input_txid, Some(child.compute_txid()));
    assert!(fx.tracker.is_output_spent(&parent_key));
    assert!(fx.tracker.unspent_for(&address(2)).is_empty());
}

#[test]
fn test_child_pooled_before_its_parent_is_linked_on_arrival() {
    let fx = fixture();
    let parent = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let child = spend(&[outpoint(&parent, 0)], &[(address(3), 8_000)]);

    assert_eq!(fx.ingest(&[&child]).accepted, vec![child.compute_txid()]);
    assert!(fx.tracker.txios_for(&address(3)).unwrap().values().all(|t| !t.flags.chained));

    assert_eq!(fx.ingest(&[&parent]).accepted, vec![parent.compute_txid()]);

    let parent_key = IoKey::pending(fx.id_of(&parent.compute_txid()), 0);
    let at_two = fx.tracker.txios_for(&address(2)).unwrap();
    let txio = at_two.get(&parent_key).unwrap();
    assert_eq!(txio.input_txid, Some(child.compute_txid()));
    assert!(fx.tracker.unspent_for(&address(2)).is_empty());
    assert!(fx.tracker.txios_for(&address(3)).unwrap().values().all(|t| t.flags.chained));

    // The pool is rebuilt on every purge; the link must survive it.
    mine(&fx.chain, vec![]);
    let outcome = fx.new_blocks(ReorgState::extend(0, 1));
    assert!(outcome.invalidated.is_empty());
    assert!(fx.tracker.is_output_spent(&parent_key));
    assert!(fx.tracker.unspent_for(&address(2)).is_empty());
}

#[test]
fn test_conflicting_spend_replaces_pooled_chain() {
    let fx = fixture();
    let first = rbf_spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let child = spend(&[outpoint(&first, 0)], &[(address(3), 8_000)]);
    fx.ingest(&[&first, &child]);
    assert_eq!(fx.tracker.rbf_txios_for(&address(2)).len(), 1);

    let bump = rbf_spend(&[outpoint(&fx.fund, 0)], &[(address(4), 8_500)]);
    let outcome = fx.ingest(&[&bump]);

    assert_eq!(outcome.accepted, vec![bump.compute_txid()]);
    let replaced: BTreeSet<_> = outcome.replaced.into_iter().collect();
    assert_eq!(
        replaced,
        [first.compute_txid(), child.compute_txid()].into_iter().collect()
    );
    assert!(!fx.tracker.has_transaction(&first.compute_txid()));
    assert!(!fx.tracker.has_transaction(&child.compute_txid()));
    assert!(fx.tracker.txios_for(&address(2)).is_none());
    assert!(fx.tracker.txios_for(&address(3)).is_none());

    let spent = fx.tracker.txios_for(&address(1)).unwrap();
    let txio = spent.get(&IoKey::mined(0, 0, 0)).unwrap();
    assert_eq!(txio.input_txid, Some(bump.compute_txid()));

    let last = fx.recorder.notifications.lock().last().cloned().unwrap();
    assert_eq!(last.invalidated.len(), 2);
    assert!(last.txios.get(&address(3)).map(|m| m.is_empty()).unwrap_or(false));
}

#[test]
fn test_spend_of_output_already_spent_on_chain_is_invalid() {
    let fx = fixture();
    let mined = spend(&[outpoint(&fx.fund, 0)], &[(address(9), 9_000)]);
    mine(&fx.chain, vec![mined]);
    fx.new_blocks(ReorgState::extend(0, 1));

    let late = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let outcome = fx.ingest(&[&late]);
    assert_eq!(outcome.invalid, vec![late.compute_txid()]);
    assert!(fx.tracker.view().is_empty());
}

#[test]
fn test_foreign_confirmed_inputs_are_taken_unchecked() {
    let fx = fixture();
    let foreign = coinbase(&[(address(9), 4_000)]);
    let spent = spend(&[outpoint(&foreign, 0)], &[(address(9), 3_000)]);
    mine(&fx.chain, vec![foreign.clone(), spent]);
    fx.new_blocks(ReorgState::extend(0, 1));

    // Spends an output a block already consumed, but nothing indexes it.
    let double = spend(&[outpoint(&foreign, 0)], &[(address(2), 3_500)]);
    let outcome = fx.ingest(&[&double]);

    assert_eq!(outcome.accepted, vec![double.compute_txid()]);
    let pooled = fx.tracker.view().load();
    let tx = pooled.get(&double.compute_txid()).unwrap();
    assert!(matches!(tx.inputs[0].source, InputSource::Foreign(_)));
}

#[test]
fn test_malformed_bytes_mark_only_that_transaction() {
    let fx = fixture();
    let good = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let good_txid = fx.fetcher.insert(&good);
    let junk_txid = coinbase(&[(address(2), 1)]).compute_txid();
    fx.fetcher.insert_raw(junk_txid, vec![0xde, 0xad, 0xbe, 0xef]);

    let outcome = fx
        .tracker
        .process_inventory(&[junk_txid, good_txid], Duration::from_millis(50))
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();

    assert_eq!(outcome.invalid, vec![junk_txid]);
    assert_eq!(outcome.accepted, vec![good_txid]);
}

#[test]
fn test_fetch_is_retried_before_giving_up() {
    let fx = fixture();
    let once = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let txid = fx.fetcher.insert(&once);
    fx.fetcher.flaky.lock().insert(txid, 1);

    let outcome = fx.ingest(&[&once]);
    assert_eq!(outcome.accepted, vec![txid]);
    assert_eq!(fx.fetcher.fetch_count(&txid), 2);

    let twice = spend(&[outpoint(&once, 0)], &[(address(3), 8_000)]);
    let twice_txid = fx.fetcher.insert(&twice);
    fx.fetcher.flaky.lock().insert(twice_txid, 2);
    let outcome = fx.ingest(&[&twice]);
    assert_eq!(outcome.unfetched, vec![twice_txid]);
    assert!(!fx.tracker.has_transaction(&twice_txid));
}

// =========================================================================
// Purge
// =========================================================================

#[test]
fn test_double_spent_parent_cascades_to_children() {
    let fx = fixture();
    let parent = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let child = spend(&[outpoint(&parent, 0)], &[(address(3), 8_000)]);
    let grandchild = spend(&[outpoint(&child, 0)], &[(address(4), 7_000)]);
    fx.ingest(&[&parent, &child, &grandchild]);
    let ids: BTreeSet<u32> = [&parent, &child, &grandchild]
        .iter()
        .map(|tx| fx.id_of(&tx.compute_txid()))
        .collect();

    let thief = spend(&[outpoint(&fx.fund, 0)], &[(address(9), 9_500)]);
    mine(&fx.chain, vec![thief]);
    let outcome = fx.new_blocks(ReorgState::extend(0, 1));

    assert_eq!(outcome.invalidated, ids);
    assert!(outcome.mined.is_empty());
    assert!(fx.tracker.view().is_empty());
    assert!(fx.tracker.txios_for(&address(1)).is_none());
}

#[test]
fn test_mined_parent_grafts_child() {
    let fx = fixture();
    let parent = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let child = spend(&[outpoint(&parent, 0)], &[(address(3), 8_000)]);
    fx.ingest(&[&parent, &child]);
    let parent_id = fx.id_of(&parent.compute_txid());

    mine(&fx.chain, vec![parent.clone()]);
    let outcome = fx.new_blocks(ReorgState::extend(0, 1));

    assert_eq!(outcome.mined, [parent_id].into_iter().collect());
    assert_eq!(outcome.invalidated, [parent_id].into_iter().collect());
    assert_eq!(
        outcome.mined_keys.get(&IoKey::pending(parent_id, 0)),
        Some(&IoKey::mined(1, 1, 0))
    );

    assert!(fx.tracker.has_transaction(&child.compute_txid()));
    assert!(fx.tracker.is_output_spent(&IoKey::mined(1, 1, 0)));
    let at_two = fx.tracker.txios_for(&address(2)).unwrap();
    let txio = at_two.get(&IoKey::mined(1, 1, 0)).unwrap();
    assert_eq!(txio.input_txid, Some(child.compute_txid()));
    assert!(!txio.flags.chained);
}

#[test]
fn test_chain_mined_in_one_block_is_grafted_hop_by_hop() {
    let fx = fixture();
    let a = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let b = spend(&[outpoint(&a, 0)], &[(address(3), 8_000)]);
    let c = spend(&[outpoint(&b, 0)], &[(address(4), 7_000)]);
    fx.ingest(&[&a, &b, &c]);
    let b_id = fx.id_of(&b.compute_txid());

    mine(&fx.chain, vec![a.clone(), b.clone()]);
    let outcome = fx.new_blocks(ReorgState::extend(0, 1));

    assert_eq!(outcome.mined.len(), 2);
    assert_eq!(
        outcome.mined_keys.get(&IoKey::pending(b_id, 0)),
        Some(&IoKey::mined(1, 2, 0))
    );
    assert_eq!(fx.tracker.view().len(), 1);
    assert!(fx.tracker.has_transaction(&c.compute_txid()));
    assert!(fx.tracker.is_output_spent(&IoKey::mined(1, 2, 0)));
}

#[test]
fn test_dropped_spend_makes_output_spendable_again() {
    let fx = fixture();
    let pay = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let handle = fx.tracker.push_raw_transaction(&serialize(&pay)).unwrap();
    handle.wait_timeout(WAIT).unwrap();
    assert!(fx.tracker.is_output_spent(&IoKey::mined(0, 0, 0)));

    let dropped = fx.tracker.drop_transactions(&[pay.compute_txid()]).unwrap();
    assert_eq!(dropped, vec![pay.compute_txid()]);
    assert!(!fx.tracker.is_output_spent(&IoKey::mined(0, 0, 0)));
    assert!(fx.tracker.txios_for(&address(1)).is_none());
}

#[test]
fn test_reorg_resolves_pool_against_new_branch() {
    let fx = fixture();
    let fund = coinbase(&[(address(1), 3_000)]);
    fx.chain.push_block(block(vec![fund.clone()]));
    fx.new_blocks(ReorgState::extend(0, 1));

    let pay = spend(&[outpoint(&fund, 0)], &[(address(2), 2_500)]);
    fx.ingest(&[&pay]);
    assert!(fx.tracker.is_output_spent(&IoKey::mined(1, 0, 0)));

    // The funding transaction moves one block up on the new branch.
    fx.chain.rewind(0);
    mine(&fx.chain, vec![]);
    fx.chain.push_block(block(vec![fund.clone()]));
    let outcome = fx.new_blocks(ReorgState::reorg(1, 2, 0));

    assert!(outcome.invalidated.is_empty());
    assert!(fx.tracker.has_transaction(&pay.compute_txid()));
    assert!(!fx.tracker.is_output_spent(&IoKey::mined(1, 0, 0)));
    assert!(fx.tracker.is_output_spent(&IoKey::mined(2, 0, 0)));
}

// =========================================================================
// Broadcast
// =========================================================================

#[test]
fn test_broadcast_accepted_is_pooled() {
    let fx = fixture();
    let pay = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);

    let txid = fx
        .tracker
        .broadcast(&serialize(&pay), Duration::from_secs(2), Some("viewer"))
        .unwrap();

    assert_eq!(txid, pay.compute_txid());
    assert_eq!(fx.fetcher.sent.lock().as_slice(), &[txid]);
    assert!(fx.tracker.has_transaction(&txid));
    assert!(fx.recorder.errors.lock().is_empty());
}

#[test]
fn test_broadcast_waits_for_lagging_relay() {
    let fx = fixture();
    let pay = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let txid = pay.compute_txid();
    fx.fetcher.lagging.lock().insert(txid, 2);

    assert_eq!(
        fx.tracker.broadcast(&serialize(&pay), Duration::from_secs(2), None),
        Ok(txid)
    );
    assert!(fx.tracker.has_transaction(&txid));
    assert!(fx.recorder.errors.lock().is_empty());
}

#[test]
fn test_broadcast_failures_are_distinguished() {
    let fx = fixture();
    let t = Duration::from_millis(200);

    let rejected = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 1)]);
    fx.fetcher.rejected.lock().insert(rejected.compute_txid());
    assert!(matches!(
        fx.tracker.broadcast(&serialize(&rejected), t, Some("viewer")),
        Err(BroadcastError::Rejected { .. })
    ));

    let silent = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 2)]);
    fx.fetcher.silent.lock().insert(silent.compute_txid());
    assert_eq!(
        fx.tracker.broadcast(&serialize(&silent), t, Some("viewer")),
        Err(BroadcastError::ConfirmTimeout(silent.compute_txid()))
    );

    // A peer that answers "no such transaction" has not relayed it yet.
    let unknown = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 4)]);
    fx.fetcher.silent.lock().insert(unknown.compute_txid());
    fx.fetcher.not_found.lock().insert(unknown.compute_txid());
    assert_eq!(
        fx.tracker.broadcast(&serialize(&unknown), t, None),
        Err(BroadcastError::ConfirmTimeout(unknown.compute_txid()))
    );
    assert!(fx.fetcher.fetch_count(&unknown.compute_txid()) > 1);

    *fx.fetcher.offline.lock() = true;
    let unsent = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 3)]);
    assert_eq!(
        fx.tracker.broadcast(&serialize(&unsent), t, None),
        Err(BroadcastError::SendTimeout(unsent.compute_txid()))
    );

    assert!(matches!(
        fx.tracker.broadcast(&[0x01, 0x02], t, None),
        Err(BroadcastError::Malformed(_))
    ));

    let errors = fx.recorder.errors.lock();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].1, rejected.compute_txid());
    assert_eq!(errors[1].1, silent.compute_txid());
    assert!(fx.tracker.view().is_empty());
}

// =========================================================================
// Lifecycle
// =========================================================================

#[test]
fn test_disabled_tracker_does_nothing() {
    let fx = fixture_with(IndexConfig {
        mempool_enabled: false,
        ..test_config()
    });
    let pay = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let txid = fx.fetcher.insert(&pay);

    assert!(fx.tracker.process_inventory(&[txid], Duration::from_millis(50)).is_none());
    assert!(matches!(
        fx.tracker.push_raw_transaction(&serialize(&pay)),
        Err(MempoolError::Disabled)
    ));
    assert_eq!(
        fx.tracker.purge(&ReorgState::extend(0, 0)).unwrap(),
        PurgeOutcome::default()
    );
}

#[test]
fn test_nothing_fetched_without_registered_addresses() {
    init_logs();
    let chain = Arc::new(MemoryChain::new());
    let store = Arc::new(MemoryStore::new());
    let registry = AddressRegistry::new(store.clone(), chain.clone());
    let fetcher = MockFetcher::new();
    let tracker = MempoolTracker::new(
        test_config(),
        store,
        chain,
        Arc::new(fetcher.clone()),
        Arc::new(registry),
    );

    let tx = coinbase(&[(address(1), 1)]);
    let txid = fetcher.insert(&tx);
    assert!(tracker.process_inventory(&[txid], Duration::from_millis(50)).is_none());
    assert!(fetcher.fetched.lock().is_empty());
}

#[test]
fn test_shutdown_joins_and_refuses_work() {
    let fx = fixture();
    fx.tracker.shutdown();

    let pay = spend(&[outpoint(&fx.fund, 0)], &[(address(2), 9_000)]);
    let txid = fx.fetcher.insert(&pay);
    assert!(fx.tracker.process_inventory(&[txid], Duration::from_millis(50)).is_none());
    assert!(matches!(
        fx.tracker.push_raw_transaction(&serialize(&pay)),
        Err(MempoolError::ShuttingDown)
    ));
    assert!(matches!(
        fx.tracker.purge(&ReorgState::extend(0, 0)),
        Err(MempoolError::ShuttingDown)
    ));
    // Second call is a no-op.
    fx.tracker.shutdown();
}
