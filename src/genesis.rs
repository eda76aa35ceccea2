//! Genesis dumps and inception.
//!
//! `dump` serializes the account subset of a state tree into a directory:
//! a canonical `genesis.json` plus one code, meta, and page-file family per
//! contract. `perform_inception` rebuilds a tree from such a directory and
//! is insensitive to directory-read order: inputs are sorted by account ID
//! before insertion, so ten restorations of one dump agree on the checksum.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::accounts;
use crate::identity::{AccountId, MerkleDigest};
use crate::tree::StateTree;
use crate::vm::VmState;

/// Errors from dump and inception.
#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("malformed account ID {0:?}")]
    MalformedAccountId(String),
    #[error("dump directory {} already contains files", .0.display())]
    DirectoryNotEmpty(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> GenesisError + '_ {
    move |source| GenesisError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One account's entry in `genesis.json`. Zero fields are omitted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct GenesisAccount {
    #[serde(skip_serializing_if = "Option::is_none")]
    balance: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stake: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reward: Option<u64>,
}

impl GenesisAccount {
    fn is_empty(&self) -> bool {
        self.balance.is_none() && self.stake.is_none() && self.reward.is_none()
    }
}

/// Sidecar metadata for one dumped contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ContractMeta {
    gas_balance: u64,
    num_pages: u64,
    /// Indices of non-empty pages, ascending.
    pages: Vec<u64>,
}

/// The synthetic block an inception yields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InceptionBlock {
    pub index: u64,
    pub transactions: Option<u32>,
    pub merkle: MerkleDigest,
}

#[derive(Default)]
struct DumpedContract {
    code: Vec<u8>,
    gas_balance: u64,
    num_pages: u64,
    pages: BTreeMap<u64, Vec<u8>>,
}

/// Write the account subset of `tree` into `dir`.
///
/// With `include_contracts` unset, contract accounts are left out entirely
/// (code, pages, and their balances alike).
pub fn dump(tree: &StateTree, dir: &Path, include_contracts: bool) -> Result<(), GenesisError> {
    if dir.exists() {
        let mut entries = std::fs::read_dir(dir).map_err(io_err(dir))?;
        if entries.next().is_some() {
            return Err(GenesisError::DirectoryNotEmpty(dir.to_path_buf()));
        }
    } else {
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;
    }

    let mut entries: BTreeMap<AccountId, GenesisAccount> = BTreeMap::new();
    let mut contracts: BTreeMap<AccountId, DumpedContract> = BTreeMap::new();

    tree.iterate(&[accounts::KEY_ACCOUNTS], |key, value| {
        // Layout: [accounts prefix, field, 32-byte ID, optional suffix].
        if key.len() < 2 + AccountId::LEN {
            return;
        }
        let field = key[1];
        let id = AccountId(key[2..2 + AccountId::LEN].try_into().expect("length checked"));
        let suffix = &key[2 + AccountId::LEN..];

        let as_u64 = |raw: &[u8]| <[u8; 8]>::try_from(raw).map(u64::from_le_bytes).ok();

        match field {
            accounts::FIELD_BALANCE => {
                if let Some(v) = as_u64(value).filter(|v| *v > 0) {
                    entries.entry(id).or_default().balance = Some(v);
                }
            }
            accounts::FIELD_STAKE => {
                if let Some(v) = as_u64(value).filter(|v| *v > 0) {
                    entries.entry(id).or_default().stake = Some(v);
                }
            }
            accounts::FIELD_REWARD => {
                if let Some(v) = as_u64(value).filter(|v| *v > 0) {
                    entries.entry(id).or_default().reward = Some(v);
                }
            }
            accounts::FIELD_CONTRACT_CODE => {
                contracts.entry(id).or_default().code = value.to_vec();
            }
            accounts::FIELD_CONTRACT_GAS_BALANCE => {
                if let Some(v) = as_u64(value) {
                    contracts.entry(id).or_default().gas_balance = v;
                }
            }
            accounts::FIELD_CONTRACT_NUM_PAGES => {
                if let Some(v) = as_u64(value) {
                    contracts.entry(id).or_default().num_pages = v;
                }
            }
            accounts::FIELD_CONTRACT_PAGE => {
                if let Ok(idx_bytes) = <[u8; 8]>::try_from(suffix) {
                    let idx = u64::from_be_bytes(idx_bytes);
                    contracts.entry(id).or_default().pages.insert(idx, value.to_vec());
                }
            }
            _ => {}
        }
    });

    // Contract accounts are excluded wholesale from a contract-less dump.
    if !include_contracts {
        for id in contracts.keys() {
            entries.remove(id);
        }
    }

    let genesis: BTreeMap<String, GenesisAccount> = entries
        .into_iter()
        .filter(|(_, account)| !account.is_empty())
        .map(|(id, account)| (id.to_hex(), account))
        .collect();

    let genesis_path = dir.join("genesis.json");
    let json = serde_json::to_string(&genesis).map_err(|source| GenesisError::Json {
        path: genesis_path.clone(),
        source,
    })?;
    std::fs::write(&genesis_path, json).map_err(io_err(&genesis_path))?;

    if include_contracts {
        for (id, contract) in &contracts {
            let hex = id.to_hex();

            let code_path = dir.join(format!("{}.wasm", hex));
            std::fs::write(&code_path, &contract.code).map_err(io_err(&code_path))?;

            let meta = ContractMeta {
                gas_balance: contract.gas_balance,
                num_pages: contract.num_pages,
                pages: contract.pages.keys().copied().collect(),
            };
            let meta_path = dir.join(format!("{}.meta.json", hex));
            let meta_json =
                serde_json::to_string(&meta).map_err(|source| GenesisError::Json {
                    path: meta_path.clone(),
                    source,
                })?;
            std::fs::write(&meta_path, meta_json).map_err(io_err(&meta_path))?;

            for (idx, page) in &contract.pages {
                let page_path = dir.join(format!("{}.page.{}", hex, idx));
                std::fs::write(&page_path, page).map_err(io_err(&page_path))?;
            }
        }
    }

    tracing::info!(
        dir = %dir.display(),
        accounts = genesis.len(),
        contracts = if include_contracts { contracts.len() } else { 0 },
        "dumped genesis state"
    );
    Ok(())
}

/// Rebuild a tree from a dump directory.
///
/// Accounts insert in ascending ID order with sub-fields in canonical
/// order, so the resulting checksum is independent of how the directory
/// was read.
pub fn perform_inception(tree: &mut StateTree, dir: &Path) -> Result<InceptionBlock, GenesisError> {
    let genesis_path = dir.join("genesis.json");
    let raw = std::fs::read_to_string(&genesis_path).map_err(io_err(&genesis_path))?;
    let genesis: BTreeMap<String, GenesisAccount> =
        serde_json::from_str(&raw).map_err(|source| GenesisError::Json {
            path: genesis_path.clone(),
            source,
        })?;

    let mut accounts_len = 0u64;
    for (hex, account) in &genesis {
        let id = AccountId::from_hex(hex)
            .ok_or_else(|| GenesisError::MalformedAccountId(hex.clone()))?;

        if let Some(balance) = account.balance {
            accounts::write_balance(tree, &id, balance);
        }
        if let Some(stake) = account.stake {
            accounts::write_stake(tree, &id, stake);
        }
        if let Some(reward) = account.reward {
            accounts::write_reward(tree, &id, reward);
        }
        accounts_len += 1;
    }
    accounts::write_accounts_len(tree, accounts_len);

    // Contracts: gather IDs from *.wasm files and restore in ID order.
    let mut contract_ids: Vec<AccountId> = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(hex) = name.strip_suffix(".wasm") {
            let id = AccountId::from_hex(hex)
                .ok_or_else(|| GenesisError::MalformedAccountId(hex.to_string()))?;
            contract_ids.push(id);
        }
    }
    contract_ids.sort();

    for id in contract_ids {
        let hex = id.to_hex();

        let code_path = dir.join(format!("{}.wasm", hex));
        let code = std::fs::read(&code_path).map_err(io_err(&code_path))?;

        let meta_path = dir.join(format!("{}.meta.json", hex));
        let meta_raw = std::fs::read_to_string(&meta_path).map_err(io_err(&meta_path))?;
        let meta: ContractMeta =
            serde_json::from_str(&meta_raw).map_err(|source| GenesisError::Json {
                path: meta_path.clone(),
                source,
            })?;

        accounts::write_contract_code(tree, &id, &code);
        accounts::write_contract_gas_balance(tree, &id, meta.gas_balance);
        accounts::write_contract_num_pages(tree, &id, meta.num_pages);

        let mut page_indices = meta.pages.clone();
        page_indices.sort_unstable();
        for idx in page_indices {
            let page_path = dir.join(format!("{}.page.{}", hex, idx));
            let page = std::fs::read(&page_path).map_err(io_err(&page_path))?;
            accounts::write_contract_page(tree, &id, idx, &page);
        }
    }

    Ok(InceptionBlock {
        index: 0,
        transactions: None,
        merkle: tree.checksum(),
    })
}

/// Persist a contract's full VM state into the tree (used when seeding
/// genesis contracts outside a collapse).
pub fn seed_contract(
    tree: &mut StateTree,
    id: &AccountId,
    code: &[u8],
    gas_balance: u64,
    state: &VmState,
) {
    accounts::write_contract_code(tree, id, code);
    accounts::write_contract_gas_balance(tree, id, gas_balance);
    accounts::write_contract_num_pages(tree, id, state.num_pages());
    for (idx, page) in state.pages.iter().enumerate() {
        accounts::write_contract_page(tree, id, idx as u64, page);
    }
}
