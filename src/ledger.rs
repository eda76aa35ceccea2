//! The ledger: ties the graph, the account tree, the collapse engine, the
//! conflict resolver, and the Snowball voters together.
//!
//! Ownership runs one way: the ledger owns its state and hands capability
//! handles (vote senders, account snapshots) outward; nothing upstream holds
//! a reference back into it. Concurrent collapses are permitted, but only
//! one finalization wins per snapshot generation; the loser observes
//! `Stale` and retries from a fresh snapshot.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::collapse::{collapse, CollapseError, CollapseParams, CollapseResults};
use crate::config::CascadeConfig;
use crate::conflict::ConflictResolver;
use crate::genesis::GenesisError;
use crate::graph::{Graph, GraphError};
use crate::identity::AccountId;
use crate::round::Round;
use crate::snowball::Snowball;
use crate::store::{Kv, StoreError};
use crate::transaction::{encode_payload, Tag, Transaction, TransferPayload};
use crate::tree::StateTree;
use crate::vm::ContractVm;
use crate::vote::{
    collect_finalization_votes, collect_sync_votes, FinalizationVote, SyncVote, VoteParams,
};

const ROUND_KEY_PREFIX: &[u8] = b"round/";
const ROUND_LATEST_KEY: &[u8] = b"round/latest";

/// Errors surfaced by ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Collapse(#[from] CollapseError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Genesis(#[from] GenesisError),
    #[error("graph holds no end candidate beyond the current round")]
    NoEndCandidate,
}

/// The peer transport capability.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, message: &[u8]);
    fn sample_k_peers(&self, k: usize) -> Vec<AccountId>;
}

/// In-memory broadcaster that records messages (tests, single-node mode).
#[derive(Default)]
pub struct MemBroadcaster {
    messages: Mutex<Vec<Vec<u8>>>,
    peers: Vec<AccountId>,
}

impl MemBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: Vec<AccountId>) -> Self {
        MemBroadcaster {
            messages: Mutex::new(Vec::new()),
            peers,
        }
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().clone()
    }
}

impl Broadcaster for MemBroadcaster {
    fn broadcast(&self, message: &[u8]) {
        self.messages.lock().push(message.to_vec());
    }

    fn sample_k_peers(&self, k: usize) -> Vec<AccountId> {
        self.peers.iter().take(k).copied().collect()
    }
}

/// The ledger core.
pub struct Ledger {
    config: CascadeConfig,
    node_id: AccountId,
    kv: Arc<dyn Kv>,
    vm: Arc<dyn ContractVm>,
    broadcaster: Arc<dyn Broadcaster>,

    accounts: Arc<RwLock<StateTree>>,
    graph: Arc<Graph>,
    resolver: Mutex<ConflictResolver>,
    current_round: RwLock<Round>,

    finalization_snowball: Arc<Mutex<Snowball<Round>>>,
    finalization_votes: mpsc::Sender<FinalizationVote>,
    finalization_rx: Mutex<Option<mpsc::Receiver<FinalizationVote>>>,

    sync_snowball: Arc<Mutex<Snowball<bool>>>,
    sync_votes: mpsc::Sender<SyncVote>,
    sync_rx: Mutex<Option<mpsc::Receiver<SyncVote>>>,
}

impl Ledger {
    /// Build a ledger over the given capabilities, restoring any committed
    /// tree and latest round from the KV store.
    pub fn new(
        config: CascadeConfig,
        node_id: AccountId,
        kv: Arc<dyn Kv>,
        vm: Arc<dyn ContractVm>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Ledger, LedgerError> {
        let tree = StateTree::load_from(kv.as_ref())?;
        Self::with_tree(config, node_id, kv, vm, broadcaster, tree)
    }

    /// Build a ledger whose initial tree comes from a genesis dump.
    pub fn from_genesis_dir(
        config: CascadeConfig,
        node_id: AccountId,
        kv: Arc<dyn Kv>,
        vm: Arc<dyn ContractVm>,
        broadcaster: Arc<dyn Broadcaster>,
        dir: &std::path::Path,
    ) -> Result<Ledger, LedgerError> {
        let mut tree = StateTree::new();
        let block = crate::genesis::perform_inception(&mut tree, dir)?;
        tracing::info!(merkle = %block.merkle, "performed inception");
        Self::with_tree(config, node_id, kv, vm, broadcaster, tree)
    }

    fn with_tree(
        config: CascadeConfig,
        node_id: AccountId,
        kv: Arc<dyn Kv>,
        vm: Arc<dyn ContractVm>,
        broadcaster: Arc<dyn Broadcaster>,
        tree: StateTree,
    ) -> Result<Ledger, LedgerError> {
        let faucet = config.consensus.faucet();
        let root = Transaction::new_unsigned(
            faucet,
            faucet,
            vec![],
            0,
            Tag::Transfer,
            encode_payload(&TransferPayload {
                recipient: faucet,
                amount: 0,
                invoke: None,
            }),
        )
        .expect("root transaction is well-formed");

        let graph = Arc::new(Graph::new(root.clone()));

        let current_round = match kv.get(ROUND_LATEST_KEY)? {
            Some(raw) => bincode::deserialize(&raw)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            None => Round::new(0, root.clone(), root.clone(), tree.checksum(), 0),
        };

        let mut resolver =
            ConflictResolver::new(config.consensus.beta1, config.consensus.beta2);
        resolver.seed_root(kv.as_ref(), root.id)?;

        let (finalization_votes, finalization_receiver) = mpsc::channel(64);
        let (sync_votes, sync_receiver) = mpsc::channel(64);

        Ok(Ledger {
            node_id,
            accounts: Arc::new(RwLock::new(tree)),
            graph,
            resolver: Mutex::new(resolver),
            current_round: RwLock::new(current_round),
            finalization_snowball: Arc::new(Mutex::new(Snowball::new(
                config.consensus.beta1,
                config.consensus.beta2,
            ))),
            finalization_votes,
            finalization_rx: Mutex::new(Some(finalization_receiver)),
            sync_snowball: Arc::new(Mutex::new(Snowball::new(
                config.consensus.beta1,
                config.consensus.beta2,
            ))),
            sync_votes,
            sync_rx: Mutex::new(Some(sync_receiver)),
            config,
            kv,
            vm,
            broadcaster,
        })
    }

    pub fn root_id(&self) -> crate::identity::TransactionId {
        self.graph.root_id()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn current_round(&self) -> Round {
        self.current_round.read().clone()
    }

    /// A read-only snapshot of the committed account state.
    pub fn accounts_snapshot(&self) -> StateTree {
        self.accounts.read().snapshot()
    }

    /// Shared handle for the sync vote collector.
    pub fn accounts_handle(&self) -> Arc<RwLock<StateTree>> {
        Arc::clone(&self.accounts)
    }

    /// Ingress: verify, insert into the graph, register the conflict slot,
    /// and gossip onward.
    pub fn add_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        self.graph.add(tx.clone())?;
        self.register(&tx)?;
        self.broadcaster.broadcast(&tx.to_wire());
        Ok(())
    }

    /// Ingress without signature verification (genesis funding, tests).
    pub fn add_transaction_unchecked(&self, tx: Transaction) -> Result<(), LedgerError> {
        self.graph.add_unchecked(tx.clone())?;
        self.register(&tx)?;
        Ok(())
    }

    fn register(&self, tx: &Transaction) -> Result<(), LedgerError> {
        // The sender's depth claim is its sequence number: rival spends of
        // one account state sit at the same depth and land in one slot.
        self.resolver
            .lock()
            .observe(self.kv.as_ref(), &self.graph, tx, tx.depth)?;
        Ok(())
    }

    pub fn find_transaction(&self, id: &crate::identity::TransactionId) -> Option<Transaction> {
        self.graph.find(id)
    }

    /// Deliver a peer's finalization vote. Returns false when the buffer is
    /// full (the vote is dropped, as any sampling loss would be).
    ///
    /// A vote for a round also endorses the round's end transaction, so
    /// each one counts as a conflict-set sample for that transaction's
    /// slot. Enough consecutive samples push the slot's counter past beta2
    /// and the transaction is accepted on the counter rule alone.
    pub fn submit_finalization_vote(&self, vote: FinalizationVote) -> bool {
        let end = &vote.round.end;
        self.resolver
            .lock()
            .record_vote(end.sender, end.depth, end.id);
        self.finalization_votes.try_send(vote).is_ok()
    }

    /// Deliver a peer's sync vote.
    pub fn submit_sync_vote(&self, vote: SyncVote) -> bool {
        self.sync_votes.try_send(vote).is_ok()
    }

    pub fn sync_decision(&self) -> Option<bool> {
        let snowball = self.sync_snowball.lock();
        snowball.decided().then(|| snowball.preferred().copied()).flatten()
    }

    fn vote_params(&self) -> VoteParams {
        VoteParams {
            k: self.config.consensus.snowball_k,
            minimum_stake: self.config.consensus.minimum_stake,
            sync_vote_threshold: self.config.consensus.sync_vote_threshold,
        }
    }

    /// Collapse from the current round's end down to `end` without
    /// publishing anything.
    pub fn collapse_current(&self, end: &Transaction) -> Result<CollapseResults, LedgerError> {
        let current = self.current_round.read().clone();
        let snapshot = self.accounts.read().snapshot();
        let params = CollapseParams::from_config(&self.config.consensus);
        let results = collapse(
            &self.graph,
            &snapshot,
            current.index + 1,
            &current,
            &current.end,
            end,
            true,
            self.vm.as_ref(),
            &params,
        )?;
        Ok(results)
    }

    /// Collapse against the deterministic end candidate and shape the
    /// resulting round, leaving finalization to the voters.
    pub fn propose_round(&self) -> Result<(Round, CollapseResults), LedgerError> {
        let current = self.current_round.read().clone();
        let end = self.graph.end_candidate().ok_or(LedgerError::NoEndCandidate)?;
        if end.id == current.end.id {
            return Err(LedgerError::NoEndCandidate);
        }

        let results = self.collapse_current(&end)?;
        let round = Round::new(
            current.index + 1,
            current.end.clone(),
            end,
            results.snapshot.checksum(),
            results.applied_count as u32,
        );
        Ok((round, results))
    }

    /// Publish a finalized round: swap the collapsed snapshot in, persist
    /// tree and round, and gossip the header.
    ///
    /// Fails with `Stale` if another finalizer won the generation; retry
    /// with a fresh collapse.
    pub fn finalize_round(
        &self,
        results: CollapseResults,
        end: Transaction,
    ) -> Result<Round, LedgerError> {
        let current = self.current_round.read().clone();

        let round = {
            let mut live = self.accounts.write();
            let found = live.checksum();
            if found != results.base_checksum {
                return Err(CollapseError::Stale {
                    expected: results.base_checksum,
                    found,
                }
                .into());
            }

            let round = Round::new(
                current.index + 1,
                current.end.clone(),
                end,
                results.snapshot.checksum(),
                results.applied_count as u32,
            );
            *live = results.snapshot;
            live.commit_to(self.kv.as_ref())?;
            round
        };

        let raw = bincode::serialize(&round)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut key = ROUND_KEY_PREFIX.to_vec();
        key.extend_from_slice(&round.index.to_be_bytes());
        self.kv.put(&key, &raw)?;
        self.kv.put(ROUND_LATEST_KEY, &raw)?;

        *self.current_round.write() = round.clone();
        self.broadcaster.broadcast(&round.header_wire());

        tracing::info!(
            index = round.index,
            merkle = %round.merkle,
            applied = round.transactions_count,
            "finalized round"
        );
        Ok(round)
    }

    /// Load a finalized round record by index.
    pub fn stored_round(&self, index: u64) -> Result<Option<Round>, LedgerError> {
        let mut key = ROUND_KEY_PREFIX.to_vec();
        key.extend_from_slice(&index.to_be_bytes());
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(raw) => Ok(Some(
                bincode::deserialize(&raw)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            )),
        }
    }

    /// Sweep the conflict resolver for newly acceptable transactions.
    pub fn update_accepted(&self) -> Vec<crate::identity::TransactionId> {
        match self
            .resolver
            .lock()
            .update_accepted(self.kv.as_ref(), &self.graph)
        {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accepted-index sweep failed");
                Vec::new()
            }
        }
    }

    /// One consensus step: finalize a decided round, or collapse and vote
    /// for a fresh candidate.
    pub fn consensus_step(&self) {
        let decided = {
            let snowball = self.finalization_snowball.lock();
            if snowball.decided() {
                snowball.preferred().cloned()
            } else {
                None
            }
        };

        if let Some(preferred) = decided {
            let expected_index = self.current_round.read().index + 1;
            if preferred.index == expected_index {
                match self
                    .collapse_current(&preferred.end)
                    .and_then(|results| self.finalize_round(results, preferred.end.clone()))
                {
                    Ok(_) => self.finalization_snowball.lock().reset(),
                    Err(LedgerError::Collapse(CollapseError::MissingAncestor {
                        missing, ..
                    })) => {
                        tracing::debug!(?missing, "deferring finalization on missing ancestor");
                    }
                    Err(LedgerError::Collapse(CollapseError::Stale { .. })) => {
                        tracing::debug!("stale finalization, retrying from fresh snapshot");
                    }
                    Err(e) => tracing::warn!(error = %e, "finalization failed"),
                }
            } else {
                // A decision for a round we already moved past.
                self.finalization_snowball.lock().reset();
            }
            return;
        }

        // No decision yet: put our own candidate up for sampling.
        match self.propose_round() {
            Ok((round, _results)) => {
                self.broadcaster.broadcast(&round.header_wire());
                self.submit_finalization_vote(FinalizationVote {
                    voter: self.node_id,
                    round,
                });
            }
            Err(LedgerError::NoEndCandidate) => {}
            Err(LedgerError::Collapse(CollapseError::MissingAncestor { missing, .. })) => {
                tracing::debug!(?missing, "candidate collapse blocked on missing ancestor");
            }
            Err(e) => tracing::warn!(error = %e, "candidate collapse failed"),
        }
    }

    /// Drive the ledger until `shutdown` flips: spawns the vote collectors
    /// and runs the collapse and acceptance timers.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let finalization_rx = self
            .finalization_rx
            .lock()
            .take()
            .expect("run may only be called once");
        let sync_rx = self.sync_rx.lock().take().expect("run may only be called once");

        let finalization_task = tokio::spawn(collect_finalization_votes(
            Arc::clone(&self.finalization_snowball),
            finalization_rx,
            self.vote_params(),
        ));
        let sync_task = tokio::spawn(collect_sync_votes(
            self.accounts_handle(),
            Arc::clone(&self.sync_snowball),
            sync_rx,
            self.vote_params(),
        ));

        let mut collapse_timer = tokio::time::interval(std::time::Duration::from_millis(
            self.config.node.collapse_interval_ms,
        ));
        let mut accept_timer = tokio::time::interval(std::time::Duration::from_millis(
            self.config.node.accept_interval_ms,
        ));

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = accept_timer.tick() => {
                    self.update_accepted();
                }
                _ = collapse_timer.tick() => {
                    self.consensus_step();
                }
            }
        }

        // Tear the collectors down with the loop; any partial batch dies
        // untallied, exactly as a closed vote channel would leave it.
        finalization_task.abort();
        sync_task.abort();
        tracing::info!("ledger loop stopped");
    }
}
