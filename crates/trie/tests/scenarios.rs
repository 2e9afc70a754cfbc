//! End-to-end scenarios against `LiveTrie`: multiple accounts, storage slots, deletions
//! and reopening a directory across process boundaries.

use ethereum_types::U256;
use hex_literal::hex;
use state_trie::{AccountInfo, Address, ArchiveTrie, Configuration, Hash, Key, LiveTrie, Update, Value};

fn test_config() -> Configuration {
    let mut cfg = Configuration::live_with_node();
    cfg.node_cache_capacity = 128;
    cfg.hash_cache_capacity = 128;
    cfg.write_buffer_capacity = 16;
    cfg
}

/// Builds a 20-byte address from a hex string, the same `0x01…00`-style shorthand §8 uses
/// for its scenario addresses (a single distinguishing leading byte, the rest zero).
fn address_from_hex(s: &str) -> Address {
    Address::from_slice(&hex::decode(s).unwrap())
}

/// Builds a 32-byte hash/key/value from a hex string, same shorthand as `address_from_hex`.
fn word_from_hex(s: &str) -> Hash {
    Hash::from_slice(&hex::decode(s).unwrap())
}

#[test]
fn two_accounts_sharing_a_hashed_address_prefix_stay_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();

    // These two addresses are chosen arbitrarily; what matters is that their Keccak hashes
    // are unrelated, which any two distinct addresses satisfy with overwhelming probability.
    let a = Address::repeat_byte(0xaa);
    let b = Address::repeat_byte(0xbb);
    trie.set_account(&a, AccountInfo::new(1, U256::from(10u64), Hash::zero())).unwrap();
    trie.set_account(&b, AccountInfo::new(2, U256::from(20u64), Hash::zero())).unwrap();

    assert_eq!(trie.get_account(&a).unwrap().unwrap().balance, U256::from(10u64));
    assert_eq!(trie.get_account(&b).unwrap().unwrap().balance, U256::from(20u64));
}

#[test]
fn many_accounts_and_slots_round_trip_through_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let addresses: Vec<Address> = (0..40u8).map(Address::repeat_byte).collect();
    let key = Key::repeat_byte(7);

    {
        let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
        for (i, address) in addresses.iter().enumerate() {
            trie.set_account(address, AccountInfo::new(i as u64, U256::from(i as u64), Hash::zero()))
                .unwrap();
            trie.set_value(address, &key, Value::repeat_byte(i as u8)).unwrap();
        }
        trie.close().unwrap();
    }

    let trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    for (i, address) in addresses.iter().enumerate() {
        let info = trie.get_account(address).unwrap().unwrap();
        assert_eq!(info.nonce, i as u64);
        assert_eq!(trie.get_value(address, &key).unwrap(), Some(Value::repeat_byte(i as u8)));
    }
}

#[test]
fn deleting_an_account_removes_it_but_keeps_its_neighbors() {
    let dir = tempfile::tempdir().unwrap();
    let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();

    let kept = Address::repeat_byte(1);
    let removed = Address::repeat_byte(2);
    trie.set_account(&kept, AccountInfo::new(1, U256::from(1u64), Hash::zero())).unwrap();
    trie.set_account(&removed, AccountInfo::new(1, U256::from(2u64), Hash::zero())).unwrap();

    let mut update = Update::new();
    update.deleted_accounts.push(removed);
    trie.apply_update(&update).unwrap();

    assert_eq!(trie.get_account(&removed).unwrap(), None);
    assert_eq!(trie.get_account(&kept).unwrap().unwrap().balance, U256::from(1u64));
}

#[test]
fn clearing_storage_does_not_touch_account_fields() {
    let dir = tempfile::tempdir().unwrap();
    let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    let address = Address::repeat_byte(5);
    let key = Key::repeat_byte(1);

    trie.set_account(&address, AccountInfo::new(3, U256::from(99u64), Hash::zero())).unwrap();
    trie.set_value(&address, &key, Value::repeat_byte(1)).unwrap();
    trie.clear_storage(&address).unwrap();

    assert_eq!(trie.get_value(&address, &key).unwrap(), None);
    let info = trie.get_account(&address).unwrap().unwrap();
    assert_eq!(info.nonce, 3);
    assert_eq!(info.balance, U256::from(99u64));
}

#[test]
fn root_hash_changes_when_content_changes_and_is_deterministic() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut trie_a = LiveTrie::open(dir_a.path(), test_config()).unwrap();
    let mut trie_b = LiveTrie::open(dir_b.path(), test_config()).unwrap();

    let address = Address::repeat_byte(9);
    let info = AccountInfo::new(1, U256::from(42u64), Hash::zero());
    trie_a.set_account(&address, info).unwrap();
    trie_b.set_account(&address, info).unwrap();

    let (hash_a, _) = trie_a.update_hashes().unwrap();
    let (hash_b, _) = trie_b.update_hashes().unwrap();
    assert_eq!(hash_a, hash_b);

    trie_a.set_account(&address, AccountInfo::new(2, U256::from(42u64), Hash::zero())).unwrap();
    let (hash_a_after, _) = trie_a.update_hashes().unwrap();
    assert_ne!(hash_a, hash_a_after);
}

// The following scenarios pin down the exact root hashes of the mainstream
// Ethereum-compatible MPT encoding, not just hash determinism: they are the regression
// tests for `encode_account_leaf`'s `storage_root`/`code_hash` handling.

#[test]
fn spec_scenario_1_empty_trie_root() {
    let dir = tempfile::tempdir().unwrap();
    let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    let (root, _) = trie.update_hashes().unwrap();
    assert_eq!(
        root,
        Hash::from_slice(&hex!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"))
    );
}

#[test]
fn spec_scenario_2_single_account_empty_code_and_storage() {
    let dir = tempfile::tempdir().unwrap();
    let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    let address = address_from_hex("0100000000000000000000000000000000000000");
    trie.set_account(&address, AccountInfo::new(10, U256::from(12u64), Hash::zero()))
        .unwrap();

    let (root, _) = trie.update_hashes().unwrap();
    assert_eq!(
        root,
        Hash::from_slice(&hex!("b2a1a4be2813ecd7b3e312d080e0f94b00a3247d361ddde75d926411660e042e"))
    );
}

#[test]
fn spec_scenario_3_account_with_one_storage_slot() {
    let dir = tempfile::tempdir().unwrap();
    let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    let address = address_from_hex("0100000000000000000000000000000000000000");
    trie.set_account(&address, AccountInfo::new(10, U256::from(12u64), Hash::zero()))
        .unwrap();
    let key = word_from_hex("0100000000000000000000000000000000000000000000000000000000000000");
    let value = word_from_hex("0200000000000000000000000000000000000000000000000000000000000000");
    trie.set_value(&address, &key, value).unwrap();

    let (root, _) = trie.update_hashes().unwrap();
    assert_eq!(
        root,
        Hash::from_slice(&hex!("a175fd37774a9f29ce92f6ded173ed65340434c22af8d480a688f0dfd3980446"))
    );
}

#[test]
fn spec_scenario_4_two_unrelated_accounts() {
    let dir = tempfile::tempdir().unwrap();
    let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    let a = address_from_hex("0100000000000000000000000000000000000000");
    let b = address_from_hex("0200000000000000000000000000000000000000");
    trie.set_account(&a, AccountInfo::new(10, U256::zero(), Hash::zero())).unwrap();
    trie.set_account(&b, AccountInfo::new(0, U256::from(12u64), Hash::zero())).unwrap();

    let (root, _) = trie.update_hashes().unwrap();
    assert_eq!(
        root,
        Hash::from_slice(&hex!("35cbb888517267cce1de8b870042f3777ecabf1b6f37ff9d9a68c1d2b74178c6"))
    );
}

#[test]
fn spec_scenario_5_two_accounts_sharing_a_hashed_address_byte() {
    let dir = tempfile::tempdir().unwrap();
    let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    let a = address_from_hex("0400000000000000000000000000000000000000");
    let b = address_from_hex("2f00000000000000000000000000000000000000");
    // nonce/balance aren't pinned by the scenario beyond the accounts existing; nonce = 1
    // for both is the minimal non-empty account, consistent with scenario 2/4's style.
    trie.set_account(&a, AccountInfo::new(1, U256::zero(), Hash::zero())).unwrap();
    trie.set_account(&b, AccountInfo::new(1, U256::zero(), Hash::zero())).unwrap();

    let (root, _) = trie.update_hashes().unwrap();
    assert_eq!(
        root,
        Hash::from_slice(&hex!("1fbd95cd060ea80f90255236f46f2d1ec829a13124befababc35222f10eb1af4"))
    );
}

#[test]
fn spec_scenario_6_archive_balance_history_inherits_between_updates() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = ArchiveTrie::open(dir.path(), state_trie::Configuration::archive_with_parent()).unwrap();
    let addr1 = address_from_hex("0100000000000000000000000000000000000000");

    let mut block1 = Update::new();
    block1.created_accounts.push(addr1);
    block1.balances.push((addr1, U256::from(1u64)));
    archive.add(1, &block1, None).unwrap();

    archive.add(2, &Update::new(), None).unwrap();

    let mut block3 = Update::new();
    block3.balances.push((addr1, U256::from(2u64)));
    archive.add(3, &block3, None).unwrap();

    let balances: Vec<u64> = (0..=3)
        .map(|block| {
            archive
                .get_account(block, &addr1)
                .unwrap()
                .map(|info| info.balance.as_u64())
                .unwrap_or(0)
        })
        .collect();
    assert_eq!(balances, vec![0, 1, 1, 2]);
}
