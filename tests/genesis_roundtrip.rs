//! Dump / inception round-trips over ledger-produced state, including
//! contracts with live memory pages.

use std::sync::Arc;

use cascade::accounts;
use cascade::config::CascadeConfig;
use cascade::genesis::{dump, perform_inception};
use cascade::identity::{AccountId, Keypair};
use cascade::ledger::{Ledger, MemBroadcaster};
use cascade::store::SledKv;
use cascade::transaction::{
    encode_payload, ContractInvoke, ContractPayload, Tag, Transaction, TransferPayload,
};
use cascade::tree::StateTree;
use cascade::vm::HashVm;

/// Build a ledger, fund accounts, spawn two contracts, poke one of them,
/// and finalize everything into the committed tree.
fn populated_ledger() -> (Ledger, Vec<AccountId>) {
    let kv = Arc::new(SledKv::open_temporary().unwrap());
    let mut config = CascadeConfig::default();
    config.consensus.snowball_k = 1;
    config.consensus.beta1 = 1;
    config.consensus.beta2 = 2;
    config.consensus.page_size = 64;

    let ledger = Ledger::new(
        config,
        AccountId([0xee; 32]),
        kv,
        Arc::new(HashVm),
        Arc::new(MemBroadcaster::new()),
    )
    .unwrap();

    let alice = Keypair::from_seed(&[41; 32]);
    let bob = Keypair::from_seed(&[42; 32]);
    {
        let handle = ledger.accounts_handle();
        let mut tree = handle.write();
        accounts::write_balance(&mut tree, &alice.account_id(), 100_000);
        accounts::write_balance(&mut tree, &bob.account_id(), 100_000);
        accounts::write_stake(&mut tree, &alice.account_id(), 250);
    }

    let spawn_a = Transaction::new(
        &alice,
        alice.account_id(),
        vec![ledger.root_id()],
        1,
        Tag::Contract,
        encode_payload(&ContractPayload::Spawn {
            code: b"contract-alpha".to_vec(),
            gas_deposit: 2_000,
        }),
    )
    .unwrap();
    let spawn_b = Transaction::new(
        &bob,
        bob.account_id(),
        vec![spawn_a.id],
        2,
        Tag::Contract,
        encode_payload(&ContractPayload::Spawn {
            code: b"contract-beta".to_vec(),
            gas_deposit: 3_000,
        }),
    )
    .unwrap();
    let contract_a = AccountId(spawn_a.id.0);
    let invoke = Transaction::new(
        &bob,
        bob.account_id(),
        vec![spawn_b.id],
        3,
        Tag::Transfer,
        encode_payload(&TransferPayload {
            recipient: contract_a,
            amount: 10,
            invoke: Some(ContractInvoke {
                entrypoint: "run".into(),
                params: b"payload".to_vec(),
                gas_budget: 1_000,
            }),
        }),
    )
    .unwrap();

    for tx in [&spawn_a, &spawn_b, &invoke] {
        ledger.add_transaction((*tx).clone()).unwrap();
    }

    let (round, results) = ledger.propose_round().unwrap();
    assert_eq!(round.transactions_count, 3);
    ledger.finalize_round(results, round.end.clone()).unwrap();

    let contracts = vec![contract_a, AccountId(spawn_b.id.0)];
    (ledger, contracts)
}

/// Compare every dumped account field family between two trees.
fn assert_dumped_fields_match(expected: &StateTree, actual: &StateTree) {
    let dumped_fields = [
        accounts::FIELD_BALANCE,
        accounts::FIELD_STAKE,
        accounts::FIELD_REWARD,
        accounts::FIELD_CONTRACT_CODE,
        accounts::FIELD_CONTRACT_GAS_BALANCE,
        accounts::FIELD_CONTRACT_NUM_PAGES,
        accounts::FIELD_CONTRACT_PAGE,
    ];
    expected.iterate(&[accounts::KEY_ACCOUNTS], |key, value| {
        let field = key[1];
        if !dumped_fields.contains(&field) {
            return;
        }
        // Zero-valued u64 fields are legitimately omitted from dumps.
        if value == 0u64.to_le_bytes() {
            return;
        }
        let restored = actual.lookup(key);
        assert_eq!(restored, Some(value), "key {:02x?}", key);
    });
}

/// S4: dump with contracts, restore ten times, one checksum.
#[test]
fn dump_restore_ten_times_one_checksum() {
    let (ledger, contracts) = populated_ledger();
    let committed = ledger.accounts_snapshot();

    let dir = tempfile::tempdir().unwrap();
    let dump_dir = dir.path().join("dump");
    dump(&committed, &dump_dir, true).unwrap();

    let mut reference = StateTree::new();
    perform_inception(&mut reference, &dump_dir).unwrap();
    let checksum = reference.checksum();

    for _ in 0..10 {
        let mut restored = StateTree::new();
        let block = perform_inception(&mut restored, &dump_dir).unwrap();
        assert_eq!(block.index, 0);
        assert_eq!(block.merkle, checksum);
        assert_eq!(restored.checksum(), checksum);
    }

    assert_dumped_fields_match(&committed, &reference);

    for contract in &contracts {
        assert!(accounts::read_contract_code(&reference, contract).is_some());
        assert!(accounts::read_contract_num_pages(&reference, contract).unwrap() > 0);
    }
    // Restored trees never carry a withdrawal queue.
    assert_eq!(reference.lookup(accounts::KEY_REWARD_WITHDRAWALS), None);
}

/// A fresh ledger boots from a dump directory with the restored checksum.
#[test]
fn ledger_boots_from_genesis_dir() {
    let (ledger, _contracts) = populated_ledger();
    let committed = ledger.accounts_snapshot();

    let dir = tempfile::tempdir().unwrap();
    let dump_dir = dir.path().join("dump");
    dump(&committed, &dump_dir, true).unwrap();

    let mut expected = StateTree::new();
    perform_inception(&mut expected, &dump_dir).unwrap();

    let booted = Ledger::from_genesis_dir(
        CascadeConfig::default(),
        AccountId([0xef; 32]),
        Arc::new(SledKv::open_temporary().unwrap()),
        Arc::new(HashVm),
        Arc::new(MemBroadcaster::new()),
        &dump_dir,
    )
    .unwrap();

    assert_eq!(booted.accounts_snapshot().checksum(), expected.checksum());
    assert_eq!(booted.current_round().index, 0);
    assert_eq!(booted.current_round().merkle, expected.checksum());
}

/// A contract-less dump drops contract accounts but keeps plain ones.
#[test]
fn contractless_dump_round_trip() {
    let (ledger, contracts) = populated_ledger();
    let committed = ledger.accounts_snapshot();

    let dir = tempfile::tempdir().unwrap();
    let dump_dir = dir.path().join("dump");
    dump(&committed, &dump_dir, false).unwrap();

    let mut restored = StateTree::new();
    perform_inception(&mut restored, &dump_dir).unwrap();

    for contract in &contracts {
        assert_eq!(accounts::read_contract_code(&restored, contract), None);
        assert_eq!(accounts::read_balance(&restored, contract), None);
    }

    let alice = Keypair::from_seed(&[41; 32]).account_id();
    assert_eq!(
        accounts::read_balance(&restored, &alice),
        accounts::read_balance(&committed, &alice)
    );
    assert_eq!(
        accounts::read_stake(&restored, &alice),
        accounts::read_stake(&committed, &alice)
    );
}
