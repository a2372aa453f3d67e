//! Core value types shared by the index, the mempool tracker and the ledgers.

use std::fmt;

use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::{Script, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

// =====================================================================
// Addresses
// =====================================================================

/// Canonical identifier of a spendable-output condition (the output script).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScriptAddress(ScriptBuf);

impl ScriptAddress {
    pub fn new(script: ScriptBuf) -> Self {
        Self(script)
    }

    pub fn from_script(script: &Script) -> Self {
        Self(script.to_owned())
    }

    pub fn as_script(&self) -> &Script {
        self.0.as_script()
    }

    /// Bare multisig outputs are indexed but never counted as spendable balance.
    pub fn is_multisig(&self) -> bool {
        self.0.as_bytes().last() == Some(&OP_CHECKMULTISIG.to_u8())
    }
}

impl fmt::Display for ScriptAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.as_bytes()))
    }
}

// =====================================================================
// Database keys
// =====================================================================

/// Position of a transaction: inside a main-chain block, or in the pending pool.
///
/// Mined refs sort before pending refs, so iterating an ordered map of keys
/// walks the confirmed history first and the mempool overlay last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TxRef {
    Mined { height: u32, index: u32 },
    Pending(u32),
}

impl TxRef {
    pub fn height(&self) -> Option<u32> {
        match self {
            TxRef::Mined { height, .. } => Some(*height),
            TxRef::Pending(_) => None,
        }
    }

    pub fn pending_id(&self) -> Option<u32> {
        match self {
            TxRef::Pending(id) => Some(*id),
            TxRef::Mined { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TxRef::Pending(_))
    }
}

/// Key of a single output (or input) of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IoKey {
    pub tx: TxRef,
    pub index: u32,
}

impl IoKey {
    pub fn mined(height: u32, tx_index: u32, index: u32) -> Self {
        Self {
            tx: TxRef::Mined { height, index: tx_index },
            index,
        }
    }

    pub fn pending(id: u32, index: u32) -> Self {
        Self {
            tx: TxRef::Pending(id),
            index,
        }
    }

    pub fn height(&self) -> Option<u32> {
        self.tx.height()
    }

    pub fn is_pending(&self) -> bool {
        self.tx.is_pending()
    }
}

impl fmt::Display for IoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tx {
            TxRef::Mined { height, index } => write!(f, "{}:{}:{}", height, index, self.index),
            TxRef::Pending(id) => write!(f, "zc{}:{}", id, self.index),
        }
    }
}

// =====================================================================
// TxIO pairs
// =====================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIoFlags {
    /// Funding or spending transaction signals replace-by-fee.
    pub rbf: bool,
    /// Spending transaction depends on an unconfirmed parent.
    pub chained: bool,
    pub multisig: bool,
}

/// A funding output and, once spent, the input consuming it.
///
/// Keyed everywhere by `output`; an output carries at most one active spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIoPair {
    pub output: IoKey,
    pub output_txid: Txid,
    pub input: Option<IoKey>,
    pub input_txid: Option<Txid>,
    pub value: u64,
    pub flags: TxIoFlags,
}

impl TxIoPair {
    pub fn funding(output: IoKey, output_txid: Txid, value: u64) -> Self {
        Self {
            output,
            output_txid,
            input: None,
            input_txid: None,
            value,
            flags: TxIoFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: TxIoFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Records `input` as the spend of this output, replacing any previous spend.
    pub fn spend(&mut self, input: IoKey, input_txid: Txid) {
        self.input = Some(input);
        self.input_txid = Some(input_txid);
    }

    pub fn clear_spend(&mut self) {
        self.input = None;
        self.input_txid = None;
        self.flags.chained = false;
    }

    pub fn is_spent(&self) -> bool {
        self.input.is_some()
    }

    pub fn has_pending_output(&self) -> bool {
        self.output.is_pending()
    }

    pub fn has_pending_input(&self) -> bool {
        self.input.map(|k| k.is_pending()).unwrap_or(false)
    }

    /// Height of the block that mined the spend, if any.
    pub fn input_height(&self) -> Option<u32> {
        self.input.and_then(|k| k.height())
    }

    pub fn touches_pending(&self, id: u32) -> bool {
        self.output.tx == TxRef::Pending(id) || self.input.map(|k| k.tx) == Some(TxRef::Pending(id))
    }
}

/// Removes from `txios` the effects of the pending transaction `id`.
///
/// Entries funded by `id` are deleted. Entries spent by `id` revert to
/// unspent when their output is itself pending; when the output is
/// confirmed the overlay entry is deleted, the confirmed record being
/// owned by the store. Returns true if anything changed.
pub fn clear_pending_effects(
    txios: &mut std::collections::BTreeMap<IoKey, TxIoPair>,
    id: u32,
) -> bool {
    let pending = TxRef::Pending(id);
    let mut changed = false;

    txios.retain(|_, txio| {
        if txio.output.tx == pending {
            changed = true;
            return false;
        }
        if txio.input.map(|k| k.tx) == Some(pending) {
            changed = true;
            if txio.has_pending_output() {
                txio.clear_spend();
                return true;
            }
            return false;
        }
        true
    });

    changed
}

// =====================================================================
// Chain events & ledger output
// =====================================================================

/// Chain-tip transition handed over by the chain-tracking collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgState {
    pub previous_top: u32,
    pub new_top: u32,
    pub branch_point: u32,
    pub previous_top_still_valid: bool,
}

impl ReorgState {
    /// Plain extension of the chain from `previous_top` to `new_top`.
    pub fn extend(previous_top: u32, new_top: u32) -> Self {
        Self {
            previous_top,
            new_top,
            branch_point: previous_top,
            previous_top_still_valid: true,
        }
    }

    /// Reorganisation that orphaned everything above `branch_point`.
    pub fn reorg(previous_top: u32, new_top: u32, branch_point: u32) -> Self {
        Self {
            previous_top,
            new_top,
            branch_point,
            previous_top_still_valid: false,
        }
    }

    /// Highest height whose content survived the transition.
    pub fn last_valid_height(&self) -> u32 {
        if self.previous_top_still_valid {
            self.previous_top
        } else {
            self.branch_point
        }
    }
}

/// Net effect of one transaction on an address (or wallet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub txid: Txid,
    pub tx_ref: TxRef,
    pub value: i64,
    pub rbf: bool,
    pub chained: bool,
}

impl LedgerEntry {
    pub fn height(&self) -> Option<u32> {
        self.tx_ref.height()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub full: i64,
    pub spendable: u64,
    pub unconfirmed: u64,
}

impl std::ops::AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.full += rhs.full;
        self.spendable += rhs.spendable;
        self.unconfirmed += rhs.unconfirmed;
    }
}
