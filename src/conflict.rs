//! Conflict sets and the accepted-transaction index.
//!
//! Transactions sharing a `(sender, nonce)` pair form a conflict set; at
//! most one of them may settle. Each transaction walks an explicit state
//! machine, `Unknown -> Pending -> Accepted`, with `Reverted` for accepted
//! transactions displaced by a late conflict. Accepted transactions are
//! indexed under a monotonic sequence in the KV store so clients can page
//! through them in acceptance order.
//!
//! Set sizes are estimated with a small HyperLogLog rather than an exact
//! set: cardinality only gates the singleton fast-path, and the estimator
//! keeps per-set memory constant no matter how wide a conflict grows.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::graph::Graph;
use crate::identity::{AccountId, TransactionId};
use crate::store::{Kv, StoreError};
use crate::transaction::Transaction;

const ACCEPTED_KEY_PREFIX: &[u8] = b"accepted/";
const ACCEPTED_INDEX_PREFIX: &[u8] = b"accepted_idx/";
const ACCEPTED_SEQUENCE: &[u8] = b"accepted";

/// Per-transaction acceptance state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxState {
    #[default]
    Unknown,
    Pending,
    Accepted,
    Reverted,
}

/// HyperLogLog with 64 six-bit registers.
#[derive(Clone)]
pub struct Hll {
    registers: [u8; 64],
}

impl Hll {
    pub fn new() -> Self {
        Hll { registers: [0; 64] }
    }

    pub fn insert(&mut self, id: &TransactionId) {
        let digest = crate::hash_domain(b"cascade.hll", id.as_ref());
        let hash = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"));

        let index = (hash >> 58) as usize; // top 6 bits
        let rest = hash << 6;
        let rank = (rest.leading_zeros() as u8 + 1).min(59);
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    pub fn cardinality(&self) -> u64 {
        const M: f64 = 64.0;
        const ALPHA: f64 = 0.709;

        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        let mut estimate = ALPHA * M * M / sum;

        // Small-range correction (linear counting).
        let zeros = self.registers.iter().filter(|&&r| r == 0).count();
        if estimate <= 2.5 * M && zeros > 0 {
            estimate = M * (M / zeros as f64).ln();
        }

        estimate.round() as u64
    }
}

impl Default for Hll {
    fn default() -> Self {
        Self::new()
    }
}

/// The equivalence class of transactions sharing `(sender, nonce)`.
pub struct ConflictSet {
    pub preferred: TransactionId,
    pub count: u32,
    seen: Hll,
}

impl ConflictSet {
    fn new(preferred: TransactionId) -> Self {
        let mut seen = Hll::new();
        seen.insert(&preferred);
        ConflictSet {
            preferred,
            count: 0,
            seen,
        }
    }

    /// Whether more than one distinct transaction claims this slot.
    pub fn is_conflicting(&self) -> bool {
        self.seen.cardinality() != 1
    }
}

/// Tracks conflict sets and drives transactions to acceptance.
pub struct ConflictResolver {
    sets: HashMap<(AccountId, u64), ConflictSet>,
    /// The `(sender, nonce)` slot each observed transaction belongs to.
    slots: HashMap<TransactionId, (AccountId, u64)>,
    states: HashMap<TransactionId, TxState>,
    /// Transactions awaiting acceptance, iterated in ID order so two nodes
    /// accept in the same sequence.
    pending: BTreeSet<TransactionId>,
    beta1: u32,
    beta2: u32,
}

impl ConflictResolver {
    pub fn new(beta1: u32, beta2: u32) -> Self {
        ConflictResolver {
            sets: HashMap::new(),
            slots: HashMap::new(),
            states: HashMap::new(),
            pending: BTreeSet::new(),
            beta1,
            beta2,
        }
    }

    /// Seed the resolver with the root transaction, accepted by definition.
    /// Idempotent across restarts: an already-indexed root is not re-indexed.
    pub fn seed_root(&mut self, kv: &dyn Kv, root: TransactionId) -> Result<(), StoreError> {
        if was_accepted(kv, &root)? {
            self.states.insert(root, TxState::Accepted);
            return Ok(());
        }
        self.index_accepted(kv, root)
    }

    pub fn state(&self, id: &TransactionId) -> TxState {
        self.states.get(id).copied().unwrap_or_default()
    }

    /// Register a transaction under its sender's nonce slot.
    ///
    /// If the slot's accepted preferred transaction turns out to be
    /// conflicting without a solid count (a too-early safe commit), it is
    /// reverted together with its ascendants.
    pub fn observe(
        &mut self,
        kv: &dyn Kv,
        graph: &Graph,
        tx: &Transaction,
        nonce: u64,
    ) -> Result<(), StoreError> {
        let key = (tx.sender, nonce);
        let (preferred, count, conflicting) = {
            let set = self
                .sets
                .entry(key)
                .or_insert_with(|| ConflictSet::new(tx.id));
            set.seen.insert(&tx.id);
            (set.preferred, set.count, set.is_conflicting())
        };
        self.slots.insert(tx.id, key);

        if self.state(&tx.id) == TxState::Unknown {
            self.states.insert(tx.id, TxState::Pending);
            self.pending.insert(tx.id);
        }

        if conflicting && count <= self.beta2 && self.state(&preferred) == TxState::Accepted {
            tracing::debug!(tx = ?preferred, "reverting early-committed conflicting transaction");
            self.revert(kv, graph, preferred)?;
        }
        Ok(())
    }

    /// Record one sampling vote for a transaction within its slot.
    /// Votes for the preferred transaction build its count; a vote for a
    /// rival displaces the preference and resets the count.
    pub fn record_vote(&mut self, sender: AccountId, nonce: u64, candidate: TransactionId) {
        let set = self
            .sets
            .entry((sender, nonce))
            .or_insert_with(|| ConflictSet::new(candidate));
        if set.preferred == candidate {
            set.count += 1;
        } else {
            set.preferred = candidate;
            set.count = 0;
        }
        set.seen.insert(&candidate);
        self.slots.insert(candidate, (sender, nonce));
    }

    pub fn conflict_set(&self, sender: &AccountId, nonce: u64) -> Option<&ConflictSet> {
        self.sets.get(&(*sender, nonce))
    }

    /// Sweep pending transactions and accept every one whose conditions
    /// hold. Returns the newly accepted IDs in acceptance order.
    pub fn update_accepted(
        &mut self,
        kv: &dyn Kv,
        graph: &Graph,
    ) -> Result<Vec<TransactionId>, StoreError> {
        let mut newly_accepted = Vec::new();

        for id in self.pending.clone() {
            let Some(tx) = graph.find(&id) else {
                continue;
            };

            let parents_accepted = tx
                .parent_ids
                .iter()
                .all(|parent| self.state(parent) == TxState::Accepted);
            if !parents_accepted {
                continue;
            }

            let (solid, singleton) = match self.slots.get(&id).and_then(|key| self.sets.get(key))
            {
                Some(set) => (set.count > self.beta2, !set.is_conflicting()),
                None => continue,
            };
            let accepted = solid
                || (singleton && count_ascendants(graph, &id, self.beta1 + 1) > self.beta1);

            if accepted && self.state(&id) != TxState::Accepted {
                self.index_accepted(kv, id)?;
                newly_accepted.push(id);

                // Children become candidates for acceptance.
                for child in graph.children(&id) {
                    if self.state(&child) != TxState::Accepted {
                        self.states.insert(child, TxState::Pending);
                        self.pending.insert(child);
                    }
                }
            }
        }

        if !newly_accepted.is_empty() {
            tracing::info!(count = newly_accepted.len(), "accepted transactions");
        }
        Ok(newly_accepted)
    }

    /// Un-accept a transaction and all of its ascendants.
    pub fn revert(
        &mut self,
        kv: &dyn Kv,
        graph: &Graph,
        id: TransactionId,
    ) -> Result<(), StoreError> {
        let mut reverted = 0usize;
        let mut visited: HashSet<TransactionId> = HashSet::new();
        let mut queue: VecDeque<TransactionId> = VecDeque::new();
        queue.push_back(id);
        visited.insert(id);

        while let Some(popped) = queue.pop_front() {
            if self.state(&popped) == TxState::Accepted {
                self.unindex_accepted(kv, popped)?;
                // Reverted transactions stay pending: they may be
                // re-accepted once their conflict resolves in their favour.
                self.states.insert(popped, TxState::Reverted);
                reverted += 1;
            }
            self.pending.insert(popped);

            for child in graph.children(&popped) {
                if visited.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        tracing::debug!(num_reverted = reverted, "reverted transactions");
        Ok(())
    }

    fn index_accepted(&mut self, kv: &dyn Kv, id: TransactionId) -> Result<(), StoreError> {
        let sequence = kv.next_sequence(ACCEPTED_SEQUENCE)?;
        kv.put(
            &[ACCEPTED_KEY_PREFIX, id.as_ref()].concat(),
            &sequence.to_be_bytes(),
        )?;
        kv.put(
            &[ACCEPTED_INDEX_PREFIX, &sequence.to_be_bytes()[..]].concat(),
            id.as_ref(),
        )?;
        self.states.insert(id, TxState::Accepted);
        self.pending.remove(&id);
        Ok(())
    }

    fn unindex_accepted(&mut self, kv: &dyn Kv, id: TransactionId) -> Result<(), StoreError> {
        let key = [ACCEPTED_KEY_PREFIX, id.as_ref()].concat();
        if let Some(sequence_bytes) = kv.get(&key)? {
            kv.delete(&[ACCEPTED_INDEX_PREFIX, &sequence_bytes[..]].concat())?;
        }
        kv.delete(&key)?;
        Ok(())
    }
}

/// Whether a transaction was durably accepted.
pub fn was_accepted(kv: &dyn Kv, id: &TransactionId) -> Result<bool, StoreError> {
    kv.has(&[ACCEPTED_KEY_PREFIX, id.as_ref()].concat())
}

/// Look up an accepted transaction ID by its acceptance sequence.
pub fn accepted_by_index(kv: &dyn Kv, index: u64) -> Result<Option<TransactionId>, StoreError> {
    let raw = kv.get(&[ACCEPTED_INDEX_PREFIX, &index.to_be_bytes()[..]].concat())?;
    Ok(raw.and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok().map(TransactionId)))
}

/// Count the ascendants (transitive children) of a transaction, stopping
/// once `limit` have been seen.
pub fn count_ascendants(graph: &Graph, id: &TransactionId, limit: u32) -> u32 {
    let mut count = 0u32;
    let mut visited: HashSet<TransactionId> = HashSet::new();
    let mut queue: VecDeque<TransactionId> = VecDeque::new();
    queue.push_back(*id);
    visited.insert(*id);

    while let Some(popped) = queue.pop_front() {
        for child in graph.children(&popped) {
            if visited.insert(child) {
                count += 1;
                if count >= limit {
                    return count;
                }
                queue.push_back(child);
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AccountId;
    use crate::store::SledKv;
    use crate::transaction::{encode_payload, StakePayload, Tag, TransferPayload};

    fn root_tx() -> Transaction {
        Transaction::new_unsigned(
            AccountId([0; 32]),
            AccountId([0; 32]),
            vec![],
            0,
            Tag::Transfer,
            encode_payload(&TransferPayload {
                recipient: AccountId([0; 32]),
                amount: 0,
                invoke: None,
            }),
        )
        .unwrap()
    }

    fn stake_tx(seed: u8, parents: Vec<TransactionId>, depth: u64) -> Transaction {
        stake_tx_amount(seed, seed as u64, parents, depth)
    }

    fn stake_tx_amount(
        seed: u8,
        amount: u64,
        parents: Vec<TransactionId>,
        depth: u64,
    ) -> Transaction {
        Transaction::new_unsigned(
            AccountId([seed; 32]),
            AccountId([seed; 32]),
            parents,
            depth,
            Tag::Stake,
            encode_payload(&StakePayload::PlaceStake(amount)),
        )
        .unwrap()
    }

    #[test]
    fn hll_counts_duplicates_once() {
        let mut hll = Hll::new();
        let id = TransactionId([1; 32]);
        hll.insert(&id);
        hll.insert(&id);
        hll.insert(&id);
        assert_eq!(hll.cardinality(), 1);
    }

    #[test]
    fn hll_estimates_small_sets() {
        let mut hll = Hll::new();
        for i in 0u8..10 {
            hll.insert(&TransactionId([i; 32]));
        }
        let estimate = hll.cardinality();
        assert!((7..=13).contains(&estimate), "estimate {}", estimate);
    }

    #[test]
    fn hll_estimates_larger_sets_within_tolerance() {
        let mut hll = Hll::new();
        for i in 0u16..1000 {
            let mut bytes = [0u8; 32];
            bytes[..2].copy_from_slice(&i.to_le_bytes());
            hll.insert(&TransactionId(bytes));
        }
        let estimate = hll.cardinality() as f64;
        assert!(
            (estimate - 1000.0).abs() / 1000.0 < 0.3,
            "estimate {}",
            estimate
        );
    }

    #[test]
    fn count_ascendants_caps_at_limit() {
        let root = root_tx();
        let root_id = root.id;
        let graph = Graph::new(root);

        let mut parent = root_id;
        for depth in 1..=5 {
            let tx = stake_tx(depth as u8, vec![parent], depth);
            parent = tx.id;
            graph.add_unchecked(tx).unwrap();
        }

        assert_eq!(count_ascendants(&graph, &root_id, 3), 3);
        assert_eq!(count_ascendants(&graph, &root_id, 100), 5);
    }

    #[test]
    fn solid_count_accepts() {
        let kv = SledKv::open_temporary().unwrap();
        let root = root_tx();
        let root_id = root.id;
        let graph = Graph::new(root);

        let mut resolver = ConflictResolver::new(2, 3);
        resolver.seed_root(&kv, root_id).unwrap();

        let tx = stake_tx(1, vec![root_id], 1);
        graph.add_unchecked(tx.clone()).unwrap();
        resolver.observe(&kv, &graph, &tx, 0).unwrap();
        assert_eq!(resolver.state(&tx.id), TxState::Pending);

        // Not enough votes yet.
        assert!(resolver.update_accepted(&kv, &graph).unwrap().is_empty());

        for _ in 0..4 {
            resolver.record_vote(tx.sender, 0, tx.id);
        }
        let accepted = resolver.update_accepted(&kv, &graph).unwrap();
        assert_eq!(accepted, vec![tx.id]);
        assert_eq!(resolver.state(&tx.id), TxState::Accepted);
        assert!(was_accepted(&kv, &tx.id).unwrap());
        assert_eq!(accepted_by_index(&kv, 2).unwrap(), Some(tx.id));
    }

    #[test]
    fn singleton_with_deep_ascendants_accepts() {
        let kv = SledKv::open_temporary().unwrap();
        let root = root_tx();
        let root_id = root.id;
        let graph = Graph::new(root);

        let beta1 = 2;
        let mut resolver = ConflictResolver::new(beta1, 100);
        resolver.seed_root(&kv, root_id).unwrap();

        // A chain of four transactions from one sender; the first has three
        // ascendants, above beta1 = 2.
        let mut parent = root_id;
        let mut txs = Vec::new();
        for depth in 1..=4 {
            let tx = stake_tx(7, vec![parent], depth);
            parent = tx.id;
            graph.add_unchecked(tx.clone()).unwrap();
            resolver.observe(&kv, &graph, &tx, depth - 1).unwrap();
            txs.push(tx);
        }

        let accepted = resolver.update_accepted(&kv, &graph).unwrap();
        assert!(accepted.contains(&txs[0].id));
        assert_eq!(resolver.state(&txs[0].id), TxState::Accepted);
        // The deepest transaction lacks ascendants and stays pending.
        assert_eq!(resolver.state(&txs[3].id), TxState::Pending);
    }

    #[test]
    fn late_conflict_reverts_cascade() {
        let kv = SledKv::open_temporary().unwrap();
        let root = root_tx();
        let root_id = root.id;
        let graph = Graph::new(root);

        let mut resolver = ConflictResolver::new(1, 50);
        resolver.seed_root(&kv, root_id).unwrap();

        // Accept a chain via the singleton path.
        let a = stake_tx(7, vec![root_id], 1);
        let b = stake_tx(8, vec![a.id], 2);
        let c = stake_tx(9, vec![b.id], 3);
        for (tx, nonce) in [(&a, 0), (&b, 0), (&c, 0)] {
            graph.add_unchecked(tx.clone()).unwrap();
            resolver.observe(&kv, &graph, tx, nonce).unwrap();
        }
        resolver.update_accepted(&kv, &graph).unwrap();
        assert_eq!(resolver.state(&a.id), TxState::Accepted);

        // A rival for a's (sender, nonce) slot arrives: a must revert, and
        // its accepted ascendants with it.
        let rival = stake_tx_amount(7, 999, vec![root_id], 1);
        assert_ne!(rival.id, a.id);
        graph.add_unchecked(rival.clone()).unwrap();
        resolver.observe(&kv, &graph, &rival, 0).unwrap();

        assert_eq!(resolver.state(&a.id), TxState::Reverted);
        assert!(!was_accepted(&kv, &a.id).unwrap());
    }
}
