//! Typed key layout and read/write helpers over the state tree.
//!
//! Every account field lives under a two-byte prefix (`accounts` global
//! prefix, then the field prefix) followed by the 32-byte account ID.
//! Contract pages carry an additional big-endian page index suffix. All
//! `u64` values are stored as 8 little-endian bytes.

use serde::{Deserialize, Serialize};

use crate::identity::AccountId;
use crate::tree::StateTree;

/// Global prefix for account-scoped keys.
pub const KEY_ACCOUNTS: u8 = 0x01;
/// Global key holding the distinct-account cardinality.
pub const KEY_ACCOUNTS_LEN: &[u8] = &[0x02];
/// Global key holding the pending reward-withdrawal queue.
pub const KEY_REWARD_WITHDRAWALS: &[u8] = &[0x03];

/// Account field prefixes.
pub const FIELD_BALANCE: u8 = 0x01;
pub const FIELD_STAKE: u8 = 0x02;
pub const FIELD_REWARD: u8 = 0x03;
pub const FIELD_NONCE: u8 = 0x04;
pub const FIELD_CONTRACT_CODE: u8 = 0x05;
pub const FIELD_CONTRACT_NUM_PAGES: u8 = 0x06;
pub const FIELD_CONTRACT_GAS_BALANCE: u8 = 0x07;
pub const FIELD_CONTRACT_PAGE: u8 = 0x08;
pub const FIELD_CONTRACT_GLOBALS: u8 = 0x09;

/// A queued reward withdrawal awaiting its settlement round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardWithdrawalRequest {
    pub account: AccountId,
    pub amount: u64,
    pub round: u64,
}

/// Build the tree key for an account field.
pub fn account_key(field: u8, id: &AccountId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + AccountId::LEN);
    key.push(KEY_ACCOUNTS);
    key.push(field);
    key.extend_from_slice(id.as_ref());
    key
}

/// Build the tree key for a contract memory page.
pub fn contract_page_key(id: &AccountId, page_idx: u64) -> Vec<u8> {
    let mut key = account_key(FIELD_CONTRACT_PAGE, id);
    key.extend_from_slice(&page_idx.to_be_bytes());
    key
}

fn decode_u64(key_kind: &str, raw: &[u8]) -> Option<u64> {
    match <[u8; 8]>::try_from(raw) {
        Ok(bytes) => Some(u64::from_le_bytes(bytes)),
        Err(_) => {
            tracing::warn!(kind = key_kind, len = raw.len(), "malformed u64 tree value");
            None
        }
    }
}

fn read_u64_field(tree: &StateTree, field: u8, kind: &str, id: &AccountId) -> Option<u64> {
    tree.lookup(&account_key(field, id))
        .and_then(|raw| decode_u64(kind, raw))
}

fn write_u64_field(tree: &mut StateTree, field: u8, id: &AccountId, value: u64) {
    tree.insert(&account_key(field, id), &value.to_le_bytes());
}

pub fn read_balance(tree: &StateTree, id: &AccountId) -> Option<u64> {
    read_u64_field(tree, FIELD_BALANCE, "balance", id)
}

pub fn write_balance(tree: &mut StateTree, id: &AccountId, balance: u64) {
    write_u64_field(tree, FIELD_BALANCE, id, balance);
}

pub fn read_stake(tree: &StateTree, id: &AccountId) -> Option<u64> {
    read_u64_field(tree, FIELD_STAKE, "stake", id)
}

pub fn write_stake(tree: &mut StateTree, id: &AccountId, stake: u64) {
    write_u64_field(tree, FIELD_STAKE, id, stake);
}

pub fn read_reward(tree: &StateTree, id: &AccountId) -> Option<u64> {
    read_u64_field(tree, FIELD_REWARD, "reward", id)
}

pub fn write_reward(tree: &mut StateTree, id: &AccountId, reward: u64) {
    write_u64_field(tree, FIELD_REWARD, id, reward);
}

pub fn read_nonce(tree: &StateTree, id: &AccountId) -> Option<u64> {
    read_u64_field(tree, FIELD_NONCE, "nonce", id)
}

pub fn write_nonce(tree: &mut StateTree, id: &AccountId, nonce: u64) {
    write_u64_field(tree, FIELD_NONCE, id, nonce);
}

pub fn read_contract_code(tree: &StateTree, id: &AccountId) -> Option<Vec<u8>> {
    tree.lookup(&account_key(FIELD_CONTRACT_CODE, id))
        .map(|v| v.to_vec())
}

pub fn write_contract_code(tree: &mut StateTree, id: &AccountId, code: &[u8]) {
    tree.insert(&account_key(FIELD_CONTRACT_CODE, id), code);
}

pub fn read_contract_gas_balance(tree: &StateTree, id: &AccountId) -> Option<u64> {
    read_u64_field(tree, FIELD_CONTRACT_GAS_BALANCE, "contract_gas_balance", id)
}

pub fn write_contract_gas_balance(tree: &mut StateTree, id: &AccountId, gas: u64) {
    write_u64_field(tree, FIELD_CONTRACT_GAS_BALANCE, id, gas);
}

pub fn read_contract_num_pages(tree: &StateTree, id: &AccountId) -> Option<u64> {
    read_u64_field(tree, FIELD_CONTRACT_NUM_PAGES, "contract_num_pages", id)
}

pub fn write_contract_num_pages(tree: &mut StateTree, id: &AccountId, num_pages: u64) {
    write_u64_field(tree, FIELD_CONTRACT_NUM_PAGES, id, num_pages);
}

pub fn read_contract_page(tree: &StateTree, id: &AccountId, page_idx: u64) -> Option<Vec<u8>> {
    tree.lookup(&contract_page_key(id, page_idx)).map(|v| v.to_vec())
}

/// Write one contract memory page. An untouched page (empty slice) is not
/// stored, and writing one removes any previous content at that index. A
/// touched page keeps its full length even when every byte is zero.
pub fn write_contract_page(tree: &mut StateTree, id: &AccountId, page_idx: u64, page: &[u8]) {
    let key = contract_page_key(id, page_idx);
    if page.is_empty() {
        tree.delete(&key);
    } else {
        tree.insert(&key, page);
    }
}

pub fn read_contract_globals(tree: &StateTree, id: &AccountId) -> Option<Vec<u8>> {
    tree.lookup(&account_key(FIELD_CONTRACT_GLOBALS, id))
        .map(|v| v.to_vec())
}

pub fn write_contract_globals(tree: &mut StateTree, id: &AccountId, globals: &[u8]) {
    tree.insert(&account_key(FIELD_CONTRACT_GLOBALS, id), globals);
}

/// Number of distinct account IDs ever written by a collapse.
pub fn read_accounts_len(tree: &StateTree) -> u64 {
    tree.lookup(KEY_ACCOUNTS_LEN)
        .and_then(|raw| decode_u64("accounts_len", raw))
        .unwrap_or(0)
}

pub fn write_accounts_len(tree: &mut StateTree, len: u64) {
    tree.insert(KEY_ACCOUNTS_LEN, &len.to_le_bytes());
}

/// Load the pending withdrawal queue. A missing or malformed value is an
/// empty queue; corruption is logged, not propagated, since the queue is
/// reconstructible from replay.
pub fn read_reward_withdrawals(tree: &StateTree) -> Vec<RewardWithdrawalRequest> {
    match tree.lookup(KEY_REWARD_WITHDRAWALS) {
        None => Vec::new(),
        Some(raw) => bincode::deserialize(raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "malformed reward withdrawal queue");
            Vec::new()
        }),
    }
}

/// Store the pending withdrawal queue, deleting the key when empty so a
/// freshly restored tree carries no queue entry.
pub fn write_reward_withdrawals(tree: &mut StateTree, queue: &[RewardWithdrawalRequest]) {
    if queue.is_empty() {
        tree.delete(KEY_REWARD_WITHDRAWALS);
    } else {
        let raw = bincode::serialize(queue).expect("withdrawal queue serialization cannot fail");
        tree.insert(KEY_REWARD_WITHDRAWALS, &raw);
    }
}
