//! Pool mutations run by the serializer thread.
//!
//! Every function here works on a private copy of the snapshot; the caller
//! installs the result in one swap, so readers never see a half-applied batch.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bitcoin::{OutPoint, Txid};

use crate::chain::ChainSource;
use crate::mempool::parsed::{InputSource, ParsedTx, TxStatus};
use crate::mempool::state::PoolSnapshot;
use crate::registry::AddressFilter;
use crate::types::{clear_pending_effects, IoKey, ScriptAddress, TxIoFlags, TxIoPair, TxRef};

#[derive(Debug, Default)]
pub(crate) struct MergeReport {
    pub accepted: Vec<Txid>,
    pub invalid: Vec<Txid>,
    /// Already pooled, already mined, or not touching any registered address.
    pub ignored: Vec<Txid>,
    /// Pooled transactions evicted by this merge: replaced by a conflicting
    /// newcomer, or spending an output their late parent does not have.
    pub replaced: BTreeMap<u32, Txid>,
    pub affected: BTreeSet<ScriptAddress>,
}

// =====================================================================
// Merge
// =====================================================================

/// Merges resolved candidates into `state`, parents before children and in
/// id order otherwise.
pub(crate) fn merge_transactions(
    state: &mut PoolSnapshot,
    txs: Vec<ParsedTx>,
    filter: &dyn AddressFilter,
) -> MergeReport {
    let mut report = MergeReport::default();

    for mut tx in parents_first(txs) {
        match tx.status {
            TxStatus::Invalid => {
                report.invalid.push(tx.txid);
                continue;
            }
            TxStatus::Mined => {
                report.ignored.push(tx.txid);
                continue;
            }
            _ => {}
        }
        if state.contains(&tx.txid) {
            report.ignored.push(tx.txid);
            continue;
        }

        // Conflicts first: a replaced parent must not be chained onto.
        let conflicts: BTreeSet<u32> = tx
            .inputs
            .iter()
            .filter_map(|i| {
                state
                    .spenders
                    .get(&i.outpoint.txid)
                    .and_then(|by_vout| by_vout.get(&i.outpoint.vout))
                    .copied()
            })
            .filter(|other| *other != tx.id)
            .collect();

        for other in conflicts {
            for (id, txid) in invalidate_with_descendants(state, other, &mut report.affected) {
                log::debug!("[MEMPOOL] {} replaces pooled {}", tx.txid, txid);
                report.replaced.insert(id, txid);
            }
        }

        if !resolve_against_pool(state, &mut tx) {
            log::debug!("[MEMPOOL] {} has a missing or invalid parent", tx.txid);
            report.invalid.push(tx.txid);
            continue;
        }

        let txios = relevant_txios(state, &tx, filter);
        if txios.is_empty() {
            log::trace!("[MEMPOOL] {} touches no registered address", tx.txid);
            report.ignored.push(tx.txid);
            continue;
        }

        let id = tx.id;
        insert_transaction(state, tx, txios, &mut report);
        link_waiting_children(state, id, filter, &mut report);
    }

    report
}

/// Orders candidates so that a transaction spending another candidate comes
/// after it.
fn parents_first(mut txs: Vec<ParsedTx>) -> Vec<ParsedTx> {
    txs.sort_by_key(|tx| tx.id);
    let index: HashMap<Txid, usize> = txs.iter().enumerate().map(|(i, tx)| (tx.txid, i)).collect();

    let mut marks = vec![Mark::Unvisited; txs.len()];
    let mut order = Vec::with_capacity(txs.len());
    for at in 0..txs.len() {
        visit(at, &txs, &index, &mut marks, &mut order);
    }

    let mut slots: Vec<Option<ParsedTx>> = txs.into_iter().map(Some).collect();
    order.into_iter().filter_map(|at| slots[at].take()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

fn visit(
    at: usize,
    txs: &[ParsedTx],
    index: &HashMap<Txid, usize>,
    marks: &mut [Mark],
    order: &mut Vec<usize>,
) {
    if marks[at] != Mark::Unvisited {
        return;
    }
    marks[at] = Mark::Visiting;
    for input in &txs[at].inputs {
        if let Some(&parent) = index.get(&input.outpoint.txid) {
            visit(parent, txs, index, marks, order);
        }
    }
    marks[at] = Mark::Done;
    order.push(at);
}

/// Resolves pool-chained inputs. Returns false if the transaction must be dropped.
fn resolve_against_pool(state: &PoolSnapshot, tx: &mut ParsedTx) -> bool {
    for input in &mut tx.inputs {
        match &input.source {
            InputSource::Unresolved => {
                let Some(parent) = state.get(&input.outpoint.txid) else {
                    continue;
                };
                let Some(out) = parent.outputs.get(input.outpoint.vout as usize) else {
                    return false;
                };
                input.source = InputSource::Chained {
                    key: parent.pending_key(input.outpoint.vout),
                    address: out.address.clone(),
                    value: out.value,
                };
                tx.rbf |= parent.rbf;
            }
            InputSource::Chained { key, .. } => {
                let parent_alive = key
                    .tx
                    .pending_id()
                    .map(|id| state.txs.contains_key(&id))
                    .unwrap_or(false);
                if !parent_alive {
                    return false;
                }
            }
            _ => {}
        }
    }

    tx.refresh_status();
    if tx.status == TxStatus::Unresolved {
        tx.status = TxStatus::ResolveAgain;
    }
    true
}

/// Txios `tx` contributes to registered addresses.
fn relevant_txios(
    state: &PoolSnapshot,
    tx: &ParsedTx,
    filter: &dyn AddressFilter,
) -> Vec<(ScriptAddress, TxIoPair)> {
    let mut txios = Vec::new();

    for (vin, input) in tx.inputs.iter().enumerate() {
        let Some((address, txio)) = spending_txio(state, tx, vin) else {
            continue;
        };
        if filter.is_registered(&address) {
            txios.push((address, txio));
        }
    }

    for (vout, out) in tx.outputs.iter().enumerate() {
        if !filter.is_registered(&out.address) {
            continue;
        }
        let flags = TxIoFlags {
            rbf: tx.rbf,
            chained: tx.chained,
            multisig: out.address.is_multisig(),
        };
        txios.push((
            out.address.clone(),
            TxIoPair::funding(tx.pending_key(vout as u32), tx.txid, out.value).with_flags(flags),
        ));
    }

    txios
}

/// The txio of the output spent by input `vin` of `tx`, with the spend applied.
fn spending_txio(state: &PoolSnapshot, tx: &ParsedTx, vin: usize) -> Option<(ScriptAddress, TxIoPair)> {
    let input = tx.inputs.get(vin)?;
    let (key, address, value, chained) = match &input.source {
        InputSource::Confirmed {
            key,
            address,
            value,
        } => (*key, address, *value, false),
        InputSource::Chained {
            key,
            address,
            value,
        } => (*key, address, *value, true),
        _ => return None,
    };

    let mut txio = state
        .txios
        .get(address)
        .and_then(|m| m.get(&key))
        .cloned()
        .unwrap_or_else(|| {
            TxIoPair::funding(key, input.outpoint.txid, value).with_flags(TxIoFlags {
                multisig: address.is_multisig(),
                ..TxIoFlags::default()
            })
        });
    txio.spend(tx.pending_key(vin as u32), tx.txid);
    txio.flags.rbf |= tx.rbf;
    txio.flags.chained = chained;
    Some((address.clone(), txio))
}

fn insert_transaction(
    state: &mut PoolSnapshot,
    tx: ParsedTx,
    txios: Vec<(ScriptAddress, TxIoPair)>,
    report: &mut MergeReport,
) {
    let id = tx.id;

    for input in &tx.inputs {
        state
            .spenders
            .entry(input.outpoint.txid)
            .or_default()
            .insert(input.outpoint.vout, id);
        if let Some(key) = input.source.key() {
            state.spent_outputs.insert(key, id);
        }
    }

    let touched = state.touched.entry(id).or_default();
    for (address, txio) in txios {
        Arc::make_mut(state.txios.entry(address.clone()).or_default()).insert(txio.output, txio);
        touched.insert(address.clone());
        report.affected.insert(address);
    }

    log::trace!("[MEMPOOL] accepted {} as zc{} ({:?})", tx.txid, id, tx.status);
    report.accepted.push(tx.txid);
    state.by_hash.insert(tx.txid, id);
    state.txs.insert(id, Arc::new(tx));
}

/// Chains pooled transactions that arrived before their parent `parent_id`
/// onto its outputs.
fn link_waiting_children(
    state: &mut PoolSnapshot,
    parent_id: u32,
    filter: &dyn AddressFilter,
    report: &mut MergeReport,
) {
    let Some(parent) = state.txs.get(&parent_id).cloned() else {
        return;
    };

    for child_id in state.children_of(&parent.txid) {
        let Some(pooled) = state.txs.get(&child_id) else {
            continue;
        };
        let waiting: Vec<usize> = pooled
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, i)| i.outpoint.txid == parent.txid && !i.source.is_resolved())
            .map(|(vin, _)| vin)
            .collect();
        if waiting.is_empty() {
            continue;
        }

        let mut child = (**pooled).clone();
        let mut missing = false;
        for &vin in &waiting {
            let input = &mut child.inputs[vin];
            let Some(out) = parent.outputs.get(input.outpoint.vout as usize) else {
                missing = true;
                break;
            };
            input.source = InputSource::Chained {
                key: parent.pending_key(input.outpoint.vout),
                address: out.address.clone(),
                value: out.value,
            };
        }
        if missing {
            log::debug!("[MEMPOOL] {} spends an output {} lacks", child.txid, parent.txid);
            for (id, txid) in invalidate_with_descendants(state, child_id, &mut report.affected) {
                report.replaced.insert(id, txid);
            }
            continue;
        }

        child.rbf |= parent.rbf;
        child.refresh_status();
        if child.status == TxStatus::Unresolved {
            child.status = TxStatus::ResolveAgain;
        }

        for &vin in &waiting {
            let Some((address, txio)) = spending_txio(state, &child, vin) else {
                continue;
            };
            state.spent_outputs.insert(txio.output, child_id);
            if !filter.is_registered(&address) {
                continue;
            }
            Arc::make_mut(state.txios.entry(address.clone()).or_default()).insert(txio.output, txio);
            state.touched.entry(child_id).or_default().insert(address.clone());
            report.affected.insert(address);
        }

        // The child's own outputs now hang off an unconfirmed parent.
        let own = TxRef::Pending(child_id);
        for address in state.touched.get(&child_id).cloned().unwrap_or_default() {
            if let Some(map) = state.txios.get_mut(&address) {
                for txio in Arc::make_mut(map).values_mut() {
                    if txio.output.tx == own {
                        txio.flags.chained = child.chained;
                        txio.flags.rbf |= child.rbf;
                    }
                }
            }
            report.affected.insert(address);
        }

        log::debug!("[MEMPOOL] linked waiting {} to late parent {}", child.txid, parent.txid);
        state.txs.insert(child_id, Arc::new(child));
    }
}

// =====================================================================
// Drop
// =====================================================================

/// Removes one transaction and every trace of it. Returns the addresses it touched.
pub(crate) fn drop_transaction(state: &mut PoolSnapshot, id: u32) -> BTreeSet<ScriptAddress> {
    let Some(tx) = state.txs.remove(&id) else {
        return BTreeSet::new();
    };
    state.by_hash.remove(&tx.txid);

    for input in &tx.inputs {
        if let Some(by_vout) = state.spenders.get_mut(&input.outpoint.txid) {
            if by_vout.get(&input.outpoint.vout) == Some(&id) {
                by_vout.remove(&input.outpoint.vout);
            }
            if by_vout.is_empty() {
                state.spenders.remove(&input.outpoint.txid);
            }
        }
        if let Some(key) = input.source.key() {
            if state.spent_outputs.get(&key) == Some(&id) {
                state.spent_outputs.remove(&key);
            }
        }
    }

    let addresses = state.touched.remove(&id).unwrap_or_default();
    for address in &addresses {
        let now_empty = match state.txios.get_mut(address) {
            Some(map) => {
                clear_pending_effects(Arc::make_mut(map), id);
                map.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.txios.remove(address);
        }
    }

    log::trace!("[MEMPOOL] dropped zc{} ({})", id, tx.txid);
    addresses
}

/// `id` followed by all its pooled descendants, breadth first.
pub(crate) fn with_descendants(state: &PoolSnapshot, id: u32) -> Vec<u32> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([id]);

    while let Some(next) = queue.pop_front() {
        if !seen.insert(next) {
            continue;
        }
        let Some(tx) = state.txs.get(&next) else {
            continue;
        };
        order.push(next);
        queue.extend(state.children_of(&tx.txid));
    }
    order
}

/// Drops `id` and its descendants, children first. Returns (id, txid) of each.
pub(crate) fn invalidate_with_descendants(
    state: &mut PoolSnapshot,
    id: u32,
    affected: &mut BTreeSet<ScriptAddress>,
) -> Vec<(u32, Txid)> {
    let doomed = with_descendants(state, id);
    let mut dropped = Vec::with_capacity(doomed.len());
    for victim in doomed.into_iter().rev() {
        if let Some(txid) = state.txs.get(&victim).map(|t| t.txid) {
            affected.extend(drop_transaction(state, victim));
            dropped.push((victim, txid));
        }
    }
    dropped
}

// =====================================================================
// Purge
// =====================================================================

#[derive(Debug, Default)]
pub(crate) struct PurgePlan {
    /// Transactions staying in the pool, grafted where their parent was mined.
    pub survivors: Vec<ParsedTx>,
    pub mined: BTreeSet<u32>,
    /// Dropped because a block spent their inputs elsewhere, with descendants.
    pub conflicted: BTreeSet<u32>,
    pub mined_keys: BTreeMap<IoKey, IoKey>,
}

/// Walks the newly connected blocks against the pool.
///
/// A pooled transaction whose input is consumed by a block leaves the pool.
/// If it was mined itself, its children are grafted onto its confirmed
/// outputs. Otherwise it was double-spent and its descendants go with it.
pub(crate) fn plan_purge(
    snapshot: &PoolSnapshot,
    chain: &dyn ChainSource,
    start: u32,
    end: u32,
) -> PurgePlan {
    let mut plan = PurgePlan::default();
    let mut pool: BTreeMap<u32, ParsedTx> = snapshot
        .txs
        .iter()
        .map(|(id, tx)| (*id, (**tx).clone()))
        .collect();
    let mut doomed_txids: HashSet<Txid> = HashSet::new();

    for height in start..=end {
        let Some(block) = chain.block(height) else {
            log::warn!("[MEMPOOL] purge stopped: block {} unavailable", height);
            break;
        };

        let mut consumed: HashSet<OutPoint> = HashSet::new();
        let mut mined: BTreeMap<Txid, u32> = BTreeMap::new();
        for (index, tx) in block.txdata.iter().enumerate() {
            consumed.extend(tx.input.iter().map(|i| i.previous_output));
            mined.insert(tx.compute_txid(), index as u32);
        }

        let hit: Vec<u32> = pool
            .iter()
            .filter(|(_, tx)| tx.inputs.iter().any(|i| consumed.contains(&i.outpoint)))
            .map(|(id, _)| *id)
            .collect();

        for id in hit {
            let Some(tx) = pool.remove(&id) else {
                continue;
            };
            match mined.get(&tx.txid) {
                Some(index) => {
                    let at = TxRef::Mined {
                        height,
                        index: *index,
                    };
                    graft_children(&mut pool, &tx, at, &mut plan.mined_keys);
                    plan.mined.insert(id);
                }
                None => {
                    doomed_txids.insert(tx.txid);
                    plan.conflicted.insert(id);
                }
            }
        }
    }

    // Cascade through every generation of a double-spent transaction.
    loop {
        let orphans: Vec<u32> = pool
            .iter()
            .filter(|(_, tx)| tx.inputs.iter().any(|i| doomed_txids.contains(&i.outpoint.txid)))
            .map(|(id, _)| *id)
            .collect();
        if orphans.is_empty() {
            break;
        }
        for id in orphans {
            if let Some(tx) = pool.remove(&id) {
                doomed_txids.insert(tx.txid);
                plan.conflicted.insert(id);
            }
        }
    }

    plan.survivors = pool.into_values().collect();
    plan
}

/// Rewrites inputs chained to `parent` onto its confirmed outputs.
///
/// Inputs that never resolved against `parent` stay unresolved; the
/// confirmed index resolves them once the pool is rebuilt.
fn graft_children(
    pool: &mut BTreeMap<u32, ParsedTx>,
    parent: &ParsedTx,
    at: TxRef,
    mined_keys: &mut BTreeMap<IoKey, IoKey>,
) {
    for child in pool.values_mut() {
        let mut grafted = false;
        for input in &mut child.inputs {
            if input.outpoint.txid != parent.txid {
                continue;
            }
            if let InputSource::Chained { key, address, value } = &input.source {
                let confirmed = IoKey {
                    tx: at,
                    index: input.outpoint.vout,
                };
                mined_keys.insert(*key, confirmed);
                input.source = InputSource::Confirmed {
                    key: confirmed,
                    address: address.clone(),
                    value: *value,
                };
                grafted = true;
            }
        }
        if grafted {
            log::debug!("[MEMPOOL] grafted {} onto mined {}", child.txid, parent.txid);
            child.refresh_status();
        }
    }
}
