//! Transaction and block builders shared by the unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Witness,
};

use crate::chain::{ChainSource, MemoryChain};
use crate::sync::Signal;
use crate::types::{ScriptAddress, TxRef};

static COINBASE_NONCE: AtomicU32 = AtomicU32::new(1);

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Pay-to-witness-pubkey-hash style script with a recognisable body.
pub fn address(n: u8) -> ScriptAddress {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend([n; 20]);
    ScriptAddress::new(ScriptBuf::from_bytes(bytes))
}

/// 1-of-1 bare multisig script.
pub fn multisig_address(n: u8) -> ScriptAddress {
    let mut bytes = vec![0x51, 0x21];
    bytes.extend([n; 33]);
    bytes.extend([0x51, 0xae]);
    ScriptAddress::new(ScriptBuf::from_bytes(bytes))
}

fn tx_out(address: &ScriptAddress, value: u64) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: address.as_script().to_owned(),
    }
}

pub fn coinbase(outputs: &[(ScriptAddress, u64)]) -> Transaction {
    let nonce = COINBASE_NONCE.fetch_add(1, Ordering::Relaxed);
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(nonce.to_le_bytes().to_vec()),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs.iter().map(|(a, v)| tx_out(a, *v)).collect(),
    }
}

fn build_spend(inputs: &[OutPoint], outputs: &[(ScriptAddress, u64)], sequence: Sequence) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|prev| TxIn {
                previous_output: *prev,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs.iter().map(|(a, v)| tx_out(a, *v)).collect(),
    }
}

pub fn spend(inputs: &[OutPoint], outputs: &[(ScriptAddress, u64)]) -> Transaction {
    build_spend(inputs, outputs, Sequence::MAX)
}

pub fn rbf_spend(inputs: &[OutPoint], outputs: &[(ScriptAddress, u64)]) -> Transaction {
    build_spend(inputs, outputs, Sequence::ENABLE_RBF_NO_LOCKTIME)
}

pub fn outpoint(tx: &Transaction, vout: u32) -> OutPoint {
    OutPoint {
        txid: tx.compute_txid(),
        vout,
    }
}

pub fn block(txdata: Vec<Transaction>) -> Block {
    let nonce = COINBASE_NONCE.fetch_add(1, Ordering::Relaxed);
    Block {
        header: Header {
            version: BlockVersion::ONE,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce,
        },
        txdata,
    }
}

/// Pushes a block holding a fresh coinbase followed by `txs`; returns its height.
pub fn mine(chain: &MemoryChain, txs: Vec<Transaction>) -> u32 {
    let mut txdata = vec![coinbase(&[(address(0xff), 50)])];
    txdata.extend(txs);
    chain.push_block(block(txdata))
}

/// Chain whose block reads stall until `release` is set, to hold a side-scan in flight.
pub struct GatedChain {
    pub inner: MemoryChain,
    pub release: Signal<()>,
}

impl GatedChain {
    pub fn new(inner: MemoryChain) -> Self {
        Self {
            inner,
            release: Signal::new(),
        }
    }
}

impl ChainSource for GatedChain {
    fn top_height(&self) -> Option<u32> {
        self.inner.top_height()
    }

    fn block(&self, height: u32) -> Option<Arc<Block>> {
        self.release.wait();
        self.inner.block(height)
    }

    fn tx_ref(&self, txid: &bitcoin::Txid) -> Option<TxRef> {
        self.inner.tx_ref(txid)
    }
}

/// Polls `cond` until it holds or five seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
