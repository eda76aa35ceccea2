//! The state collapse engine and its layered write-through cache.
//!
//! A collapse folds the ancestry of a round's `end` transaction (down to,
//! but excluding, the `start` boundary) into a mutation of the account tree.
//! All intermediate writes are buffered in a `CollapseContext` and flushed
//! once, in a canonical order, so two honest nodes with the same graph and
//! bounds produce byte-identical tree checksums.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::accounts::{
    self, RewardWithdrawalRequest,
};
use crate::config::ConsensusConfig;
use crate::graph::Graph;
use crate::identity::{AccountId, MerkleDigest, TransactionId};
use crate::round::Round;
use crate::transaction::{
    ContractInvoke, ContractPayload, StakePayload, Tag, Transaction, TransactionError,
    TransferPayload,
};
use crate::tree::StateTree;
use crate::vm::{ContractVm, VmError, VmState};

/// Fatal collapse errors. Both kinds are retryable by the caller.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CollapseError {
    #[error("missing ancestor {missing:?} while collapsing down from {end:?}")]
    MissingAncestor {
        missing: TransactionId,
        end: TransactionId,
    },
    #[error("stale state: expected merkle {expected}, found {found}")]
    Stale {
        expected: MerkleDigest,
        found: MerkleDigest,
    },
}

/// Per-transaction rejections. Collected, never thrown.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("creator {account:?} cannot pay the {fee} fee (balance {balance})")]
    InsufficientFee {
        account: AccountId,
        fee: u64,
        balance: u64,
    },
    #[error("account {account:?} has {available}, needs {needed}")]
    InsufficientBalance {
        account: AccountId,
        needed: u64,
        available: u64,
    },
    #[error("account {account:?} has {available} staked, needs {needed}")]
    InsufficientStake {
        account: AccountId,
        needed: u64,
        available: u64,
    },
    #[error("account {account:?} has {available} reward, needs {needed}")]
    InsufficientReward {
        account: AccountId,
        needed: u64,
        available: u64,
    },
    #[error("account {0:?} holds no contract")]
    NotAContract(AccountId),
    #[error("contract execution failed: {0}")]
    Vm(#[from] VmError),
    #[error("payload rejected: {0}")]
    Payload(String),
}

impl From<TransactionError> for ApplyError {
    fn from(e: TransactionError) -> Self {
        ApplyError::Payload(e.to_string())
    }
}

/// Consensus parameters the collapse engine consults.
#[derive(Clone, Debug)]
pub struct CollapseParams {
    pub faucet: AccountId,
    pub minimum_stake: u64,
    pub withdrawals_round_limit: u64,
    pub page_size: usize,
}

impl CollapseParams {
    pub fn from_config(config: &ConsensusConfig) -> Self {
        CollapseParams {
            faucet: config.faucet(),
            minimum_stake: config.minimum_stake,
            withdrawals_round_limit: config.reward_withdrawals_round_limit,
            page_size: config.page_size,
        }
    }
}

/// The applied/rejected partition a collapse produces.
#[derive(Debug)]
pub struct CollapseResults {
    /// The mutated snapshot; the caller decides whether to publish it.
    pub snapshot: StateTree,
    /// Checksum of the live tree the collapse started from, for the
    /// finalizer's optimistic-concurrency check.
    pub base_checksum: MerkleDigest,
    pub applied: Vec<Transaction>,
    pub rejected: Vec<Transaction>,
    pub rejected_errors: Vec<ApplyError>,
    pub applied_count: u64,
    pub rejected_count: u64,
    pub ignored_count: u64,
}

/// Read-through / write-back cache layered over a tree snapshot.
///
/// While a context is alive its tree must not be mutated by anyone else;
/// `flush` refuses to write if the checksum moved since construction.
pub struct CollapseContext<'a> {
    tree: StateTree,
    checksum: MerkleDigest,

    accounts_len: u64,

    // Insertion order of first writes; the flush order.
    account_ids: Vec<AccountId>,
    accounts: HashSet<AccountId>,

    balances: HashMap<AccountId, u64>,
    stakes: HashMap<AccountId, u64>,
    rewards: HashMap<AccountId, u64>,
    nonces: HashMap<AccountId, u64>,
    contract_codes: HashMap<AccountId, Vec<u8>>,
    contract_gas_balances: HashMap<AccountId, u64>,
    contract_vms: HashMap<AccountId, VmState>,

    reward_withdrawal_requests: Vec<RewardWithdrawalRequest>,

    vm_cache: LruCache<AccountId, VmState>,
    vm: &'a dyn ContractVm,
    params: CollapseParams,
}

impl<'a> CollapseContext<'a> {
    pub fn new(tree: StateTree, vm: &'a dyn ContractVm, params: CollapseParams) -> Self {
        let checksum = tree.checksum();
        let accounts_len = accounts::read_accounts_len(&tree);
        let reward_withdrawal_requests = accounts::read_reward_withdrawals(&tree);

        CollapseContext {
            tree,
            checksum,
            accounts_len,
            account_ids: Vec::new(),
            accounts: HashSet::new(),
            balances: HashMap::new(),
            stakes: HashMap::new(),
            rewards: HashMap::new(),
            nonces: HashMap::new(),
            contract_codes: HashMap::new(),
            contract_gas_balances: HashMap::new(),
            contract_vms: HashMap::new(),
            reward_withdrawal_requests,
            vm_cache: LruCache::new(
                NonZeroUsize::new(crate::constants::VM_CACHE_CAPACITY).expect("non-zero"),
            ),
            vm,
            params,
        }
    }

    fn add_account(&mut self, id: AccountId) {
        if self.accounts.insert(id) {
            self.account_ids.push(id);
        }
    }

    pub fn read_accounts_len(&self) -> u64 {
        self.accounts_len
    }

    pub fn write_accounts_len(&mut self, len: u64) {
        self.accounts_len = len;
    }

    pub fn read_balance(&mut self, id: &AccountId) -> Option<u64> {
        if let Some(balance) = self.balances.get(id) {
            return Some(*balance);
        }
        let balance = accounts::read_balance(&self.tree, id)?;
        self.balances.insert(*id, balance);
        Some(balance)
    }

    pub fn write_balance(&mut self, id: &AccountId, balance: u64) {
        self.add_account(*id);
        self.balances.insert(*id, balance);
    }

    pub fn read_stake(&mut self, id: &AccountId) -> Option<u64> {
        if let Some(stake) = self.stakes.get(id) {
            return Some(*stake);
        }
        let stake = accounts::read_stake(&self.tree, id)?;
        self.stakes.insert(*id, stake);
        Some(stake)
    }

    pub fn write_stake(&mut self, id: &AccountId, stake: u64) {
        self.add_account(*id);
        self.stakes.insert(*id, stake);
    }

    pub fn read_reward(&mut self, id: &AccountId) -> Option<u64> {
        if let Some(reward) = self.rewards.get(id) {
            return Some(*reward);
        }
        let reward = accounts::read_reward(&self.tree, id)?;
        self.rewards.insert(*id, reward);
        Some(reward)
    }

    pub fn write_reward(&mut self, id: &AccountId, reward: u64) {
        self.add_account(*id);
        self.rewards.insert(*id, reward);
    }

    pub fn read_nonce(&mut self, id: &AccountId) -> Option<u64> {
        if let Some(nonce) = self.nonces.get(id) {
            return Some(*nonce);
        }
        let nonce = accounts::read_nonce(&self.tree, id)?;
        self.nonces.insert(*id, nonce);
        Some(nonce)
    }

    pub fn write_nonce(&mut self, id: &AccountId, nonce: u64) {
        self.add_account(*id);
        self.nonces.insert(*id, nonce);
    }

    pub fn read_contract_code(&mut self, id: &AccountId) -> Option<Vec<u8>> {
        if let Some(code) = self.contract_codes.get(id) {
            return Some(code.clone());
        }
        let code = accounts::read_contract_code(&self.tree, id)?;
        self.contract_codes.insert(*id, code.clone());
        Some(code)
    }

    pub fn write_contract_code(&mut self, id: &AccountId, code: Vec<u8>) {
        self.add_account(*id);
        self.contract_codes.insert(*id, code);
    }

    pub fn read_contract_gas_balance(&mut self, id: &AccountId) -> Option<u64> {
        if let Some(gas) = self.contract_gas_balances.get(id) {
            return Some(*gas);
        }
        let gas = accounts::read_contract_gas_balance(&self.tree, id)?;
        self.contract_gas_balances.insert(*id, gas);
        Some(gas)
    }

    pub fn write_contract_gas_balance(&mut self, id: &AccountId, gas: u64) {
        self.add_account(*id);
        self.contract_gas_balances.insert(*id, gas);
    }

    pub fn set_contract_state(&mut self, id: &AccountId, state: VmState) {
        self.add_account(*id);
        self.vm_cache.put(*id, state.clone());
        self.contract_vms.insert(*id, state);
    }

    /// Resolve a contract's current VM state: overlay, then the per-collapse
    /// LRU, then the tree.
    fn contract_state(&mut self, id: &AccountId) -> VmState {
        if let Some(state) = self.contract_vms.get(id) {
            return state.clone();
        }
        if let Some(state) = self.vm_cache.get(id) {
            return state.clone();
        }
        let num_pages = accounts::read_contract_num_pages(&self.tree, id).unwrap_or(0);
        let pages = (0..num_pages)
            .map(|i| accounts::read_contract_page(&self.tree, id, i).unwrap_or_default())
            .collect();
        let globals = accounts::read_contract_globals(&self.tree, id).unwrap_or_default();
        let state = VmState { pages, globals };
        self.vm_cache.put(*id, state.clone());
        state
    }

    pub fn store_reward_withdrawal_request(&mut self, request: RewardWithdrawalRequest) {
        self.reward_withdrawal_requests.push(request);
    }

    pub fn pending_withdrawals(&self) -> &[RewardWithdrawalRequest] {
        &self.reward_withdrawal_requests
    }

    /// Settle withdrawal requests old enough to have cleared the delay;
    /// younger requests stay queued.
    pub fn process_reward_withdrawals(&mut self, round: u64) {
        if round < self.params.withdrawals_round_limit {
            return;
        }
        let round_limit = round - self.params.withdrawals_round_limit;

        let requests = std::mem::take(&mut self.reward_withdrawal_requests);
        let mut leftovers = Vec::new();

        for request in requests {
            if request.round > round_limit {
                leftovers.push(request);
                continue;
            }
            let balance = self.read_balance(&request.account).unwrap_or(0);
            self.write_balance(&request.account, balance + request.amount);
        }

        self.reward_withdrawal_requests = leftovers;
    }

    /// Write the buffered changes into the tree and return it.
    ///
    /// Accounts flush in first-write order; within an account, sub-fields
    /// flush in the fixed order balance, stake, reward, nonce, gas balance,
    /// contract code, memory pages, globals.
    pub fn flush(mut self) -> Result<StateTree, CollapseError> {
        let found = self.tree.checksum();
        if found != self.checksum {
            return Err(CollapseError::Stale {
                expected: self.checksum,
                found,
            });
        }

        accounts::write_accounts_len(&mut self.tree, self.accounts_len);
        accounts::write_reward_withdrawals(&mut self.tree, &self.reward_withdrawal_requests);

        for id in &self.account_ids {
            if let Some(balance) = self.balances.get(id) {
                accounts::write_balance(&mut self.tree, id, *balance);
            }
            if let Some(stake) = self.stakes.get(id) {
                accounts::write_stake(&mut self.tree, id, *stake);
            }
            if let Some(reward) = self.rewards.get(id) {
                accounts::write_reward(&mut self.tree, id, *reward);
            }
            if let Some(nonce) = self.nonces.get(id) {
                accounts::write_nonce(&mut self.tree, id, *nonce);
            }
            if let Some(gas) = self.contract_gas_balances.get(id) {
                accounts::write_contract_gas_balance(&mut self.tree, id, *gas);
            }
            if let Some(code) = self.contract_codes.get(id) {
                accounts::write_contract_code(&mut self.tree, id, code);
            }
            if let Some(state) = self.contract_vms.get(id) {
                accounts::write_contract_num_pages(&mut self.tree, id, state.num_pages());
                for (idx, page) in state.pages.iter().enumerate() {
                    accounts::write_contract_page(&mut self.tree, id, idx as u64, page);
                }
                accounts::write_contract_globals(&mut self.tree, id, &state.globals);
            }
        }

        Ok(self.tree)
    }

    /// Apply a transaction's payload semantics into the overlay.
    ///
    /// Validation precedes every mutation within a payload kind, so a
    /// rejected transaction leaves no partial payload effects behind.
    pub fn apply_transaction(&mut self, round: u64, tx: &Transaction) -> Result<(), ApplyError> {
        match tx.tag {
            Tag::Transfer => {
                let payload = tx.transfer_payload()?;
                self.apply_transfer(&tx.sender, &payload)
            }
            Tag::Stake => {
                let payload = tx.stake_payload()?;
                self.apply_stake(round, &tx.sender, &payload)
            }
            Tag::Contract => {
                let payload = tx.contract_payload()?;
                self.apply_contract(tx, &payload)
            }
            Tag::Batch => {
                for item in tx.batch_payload()? {
                    match Tag::from_u8(item.tag) {
                        Some(Tag::Transfer) => {
                            let payload: TransferPayload =
                                bincode::deserialize(&item.payload)
                                    .map_err(|e| ApplyError::Payload(e.to_string()))?;
                            self.apply_transfer(&tx.sender, &payload)?;
                        }
                        Some(Tag::Stake) => {
                            let payload: StakePayload = bincode::deserialize(&item.payload)
                                .map_err(|e| ApplyError::Payload(e.to_string()))?;
                            self.apply_stake(round, &tx.sender, &payload)?;
                        }
                        Some(Tag::Contract) => {
                            let payload: ContractPayload =
                                bincode::deserialize(&item.payload)
                                    .map_err(|e| ApplyError::Payload(e.to_string()))?;
                            self.apply_contract(tx, &payload)?;
                        }
                        Some(Tag::Batch) | None => {
                            return Err(ApplyError::Payload(format!(
                                "invalid batch item tag {}",
                                item.tag
                            )));
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn apply_transfer(
        &mut self,
        sender: &AccountId,
        payload: &TransferPayload,
    ) -> Result<(), ApplyError> {
        let sender_balance = self.read_balance(sender).unwrap_or(0);
        if sender_balance < payload.amount {
            return Err(ApplyError::InsufficientBalance {
                account: *sender,
                needed: payload.amount,
                available: sender_balance,
            });
        }

        // Invoke before mutating balances so a VM failure rejects the
        // transfer without partial effects.
        if let Some(invoke) = &payload.invoke {
            let code = self
                .read_contract_code(&payload.recipient)
                .ok_or(ApplyError::NotAContract(payload.recipient))?;
            self.invoke_contract(&payload.recipient, &code, invoke)?;
        }

        self.write_balance(sender, sender_balance - payload.amount);
        let recipient_balance = self.read_balance(&payload.recipient).unwrap_or(0);
        self.write_balance(&payload.recipient, recipient_balance + payload.amount);
        Ok(())
    }

    fn apply_stake(
        &mut self,
        round: u64,
        sender: &AccountId,
        payload: &StakePayload,
    ) -> Result<(), ApplyError> {
        match *payload {
            StakePayload::PlaceStake(amount) => {
                let balance = self.read_balance(sender).unwrap_or(0);
                if balance < amount {
                    return Err(ApplyError::InsufficientBalance {
                        account: *sender,
                        needed: amount,
                        available: balance,
                    });
                }
                let stake = self.read_stake(sender).unwrap_or(0);
                self.write_balance(sender, balance - amount);
                self.write_stake(sender, stake + amount);
            }
            StakePayload::WithdrawStake(amount) => {
                let stake = self.read_stake(sender).unwrap_or(0);
                if stake < amount {
                    return Err(ApplyError::InsufficientStake {
                        account: *sender,
                        needed: amount,
                        available: stake,
                    });
                }
                let balance = self.read_balance(sender).unwrap_or(0);
                self.write_stake(sender, stake - amount);
                self.write_balance(sender, balance + amount);
            }
            StakePayload::WithdrawReward(amount) => {
                let reward = self.read_reward(sender).unwrap_or(0);
                if reward < amount {
                    return Err(ApplyError::InsufficientReward {
                        account: *sender,
                        needed: amount,
                        available: reward,
                    });
                }
                self.write_reward(sender, reward - amount);
                self.store_reward_withdrawal_request(RewardWithdrawalRequest {
                    account: *sender,
                    amount,
                    round,
                });
            }
        }
        Ok(())
    }

    fn apply_contract(
        &mut self,
        tx: &Transaction,
        payload: &ContractPayload,
    ) -> Result<(), ApplyError> {
        match payload {
            ContractPayload::Spawn { code, gas_deposit } => {
                // The gas payer is the creator; the contract's account ID is
                // the spawning transaction's ID.
                let contract_id = AccountId(tx.id.0);
                let payer_balance = self.read_balance(&tx.creator).unwrap_or(0);
                if payer_balance < *gas_deposit {
                    return Err(ApplyError::InsufficientBalance {
                        account: tx.creator,
                        needed: *gas_deposit,
                        available: payer_balance,
                    });
                }

                let state = self.vm.instantiate(code, self.params.page_size)?;

                self.write_balance(&tx.creator, payer_balance - *gas_deposit);
                self.write_contract_code(&contract_id, code.clone());
                self.write_contract_gas_balance(&contract_id, *gas_deposit);
                self.set_contract_state(&contract_id, state);
            }
            ContractPayload::DepositGas {
                contract_id,
                amount,
            } => {
                if self.read_contract_code(contract_id).is_none() {
                    return Err(ApplyError::NotAContract(*contract_id));
                }
                let payer_balance = self.read_balance(&tx.creator).unwrap_or(0);
                if payer_balance < *amount {
                    return Err(ApplyError::InsufficientBalance {
                        account: tx.creator,
                        needed: *amount,
                        available: payer_balance,
                    });
                }
                let gas = self.read_contract_gas_balance(contract_id).unwrap_or(0);
                self.write_balance(&tx.creator, payer_balance - *amount);
                self.write_contract_gas_balance(contract_id, gas + *amount);
            }
        }
        Ok(())
    }

    fn invoke_contract(
        &mut self,
        contract_id: &AccountId,
        code: &[u8],
        invoke: &ContractInvoke,
    ) -> Result<(), ApplyError> {
        let gas_balance = self.read_contract_gas_balance(contract_id).unwrap_or(0);
        let budget = invoke.gas_budget.min(gas_balance);

        let state = self.contract_state(contract_id);
        let outcome = self
            .vm
            .invoke(code, &state, &invoke.entrypoint, &invoke.params, budget)?;

        self.write_contract_gas_balance(contract_id, gas_balance - outcome.gas_used);
        self.set_contract_state(contract_id, outcome.state);
        Ok(())
    }
}

/// Collapse the ancestry of `end` (exclusive of the `start` boundary) into
/// a mutation of `accounts`, yielding the applied/rejected partition.
#[allow(clippy::too_many_arguments)]
pub fn collapse(
    graph: &Graph,
    accounts: &StateTree,
    round_index: u64,
    current: &Round,
    start: &Transaction,
    end: &Transaction,
    logging: bool,
    vm: &dyn ContractVm,
    params: &CollapseParams,
) -> Result<CollapseResults, CollapseError> {
    let base_checksum = accounts.checksum();
    let mut snapshot = accounts.snapshot();
    snapshot.set_view_id(round_index);

    // Ancestor discovery: BFS backwards from `end`, stopping at the start
    // boundary. Parent lists are canonically sorted, so the traversal (and
    // therefore the application order) is identical on every honest node.
    let mut visited: HashSet<TransactionId> = HashSet::new();
    visited.insert(start.id);

    let mut queue: VecDeque<Transaction> = VecDeque::new();
    queue.push_back(end.clone());

    let mut order: Vec<Transaction> = Vec::new();

    while let Some(popped) = queue.pop_front() {
        if popped.depth <= start.depth {
            continue;
        }

        for parent_id in &popped.parent_ids {
            if !visited.insert(*parent_id) {
                continue;
            }
            match graph.find(parent_id) {
                Some(parent) => queue.push_back(parent),
                None => {
                    graph.mark_missing(*parent_id, popped.depth);
                    return Err(CollapseError::MissingAncestor {
                        missing: *parent_id,
                        end: end.id,
                    });
                }
            }
        }

        order.push(popped);
    }

    let mut results = CollapseResults {
        snapshot: StateTree::new(),
        base_checksum,
        applied: Vec::with_capacity(order.len()),
        rejected: Vec::with_capacity(order.len()),
        rejected_errors: Vec::with_capacity(order.len()),
        applied_count: 0,
        rejected_count: 0,
        ignored_count: 0,
    };

    let mut ctx = CollapseContext::new(snapshot, vm, params.clone());

    let mut total_stake: u64 = 0;
    let mut total_fee: u64 = 0;
    let mut stakes: HashMap<AccountId, u64> = HashMap::new();
    // First-accumulation order; reward distribution iterates this, never
    // the map.
    let mut staker_order: Vec<AccountId> = Vec::new();

    // Apply in reverse discovery order: earliest depth first.
    for tx in order.into_iter().rev() {
        let nonce = ctx.read_nonce(&tx.creator);
        if nonce.is_none() {
            ctx.write_accounts_len(ctx.read_accounts_len() + 1);
        }
        ctx.write_nonce(&tx.creator, nonce.unwrap_or(0) + 1);

        if tx.creator != params.faucet {
            let fee = tx.fee();
            let creator_balance = ctx.read_balance(&tx.creator).unwrap_or(0);
            if creator_balance < fee {
                results.rejected_count += tx.logical_units();
                results.rejected_errors.push(ApplyError::InsufficientFee {
                    account: tx.creator,
                    fee,
                    balance: creator_balance,
                });
                results.rejected.push(tx);
                continue;
            }

            ctx.write_balance(&tx.creator, creator_balance - fee);
            total_fee += fee;

            let stake = ctx.read_stake(&tx.sender).unwrap_or(0);
            if stake >= params.minimum_stake {
                match stakes.entry(tx.sender) {
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(stake);
                        staker_order.push(tx.sender);
                    }
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        *entry.get_mut() += stake;
                    }
                }
                total_stake += stake;
            }
        }

        if let Err(err) = ctx.apply_transaction(round_index, &tx) {
            if logging {
                tracing::error!(tx = ?tx.id, error = %err, "error applying transaction");
            }
            results.rejected_count += tx.logical_units();
            results.rejected_errors.push(err);
            results.rejected.push(tx);
            continue;
        }

        results.applied_count += tx.logical_units();
        results.applied.push(tx);
    }

    // Stake-weighted fee rewards with floor rounding; the residual is
    // neither minted nor carried forward.
    if total_stake > 0 {
        for sender in &staker_order {
            let stake = stakes[sender];
            let reward =
                (total_fee as u128 * stake as u128 / total_stake as u128) as u64;
            let current_reward = ctx.read_reward(sender).unwrap_or(0);
            ctx.write_reward(sender, current_reward + reward);
        }
    }

    for tx in graph.transactions_by_depth(Some(start.depth), Some(end.depth)) {
        results.ignored_count += tx.logical_units();
    }
    results.ignored_count = results
        .ignored_count
        .saturating_sub(results.applied_count + results.rejected_count);

    ctx.process_reward_withdrawals(round_index);

    if logging {
        tracing::debug!(
            round = round_index,
            current = current.index,
            applied = results.applied_count,
            rejected = results.rejected_count,
            ignored = results.ignored_count,
            "collapsed round candidate"
        );
    }

    results.snapshot = ctx.flush()?;
    Ok(results)
}
