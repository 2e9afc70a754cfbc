//! End-to-end scenarios against `ArchiveTrie`: per-block history, gaps, and reopening.

use ethereum_types::U256;
use state_trie::{AccountInfo, Address, ArchiveTrie, Configuration, Hash, Update};

fn test_config() -> Configuration {
    let mut cfg = Configuration::archive_with_parent();
    cfg.node_cache_capacity = 128;
    cfg.hash_cache_capacity = 128;
    cfg.write_buffer_capacity = 16;
    cfg
}

#[test]
fn each_block_keeps_its_own_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = ArchiveTrie::open(dir.path(), test_config()).unwrap();
    let address = Address::repeat_byte(1);

    for block in 0..5u64 {
        let mut update = Update::new();
        if block == 0 {
            update.created_accounts.push(address);
        }
        update.balances.push((address, U256::from(block)));
        archive.add(block, &update, None).unwrap();
    }

    for block in 0..5u64 {
        let info = archive.get_account(block, &address).unwrap().unwrap();
        assert_eq!(info.balance, U256::from(block));
    }
}

#[test]
fn block_height_tracks_the_last_call_to_add() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = ArchiveTrie::open(dir.path(), test_config()).unwrap();
    assert_eq!(archive.get_block_height(), None);

    archive.add(0, &Update::new(), None).unwrap();
    assert_eq!(archive.get_block_height(), Some(0));

    archive.add(3, &Update::new(), None).unwrap();
    assert_eq!(archive.get_block_height(), Some(3));
}

#[test]
fn a_new_account_created_in_a_later_block_does_not_exist_earlier() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = ArchiveTrie::open(dir.path(), test_config()).unwrap();
    let address = Address::repeat_byte(2);

    archive.add(0, &Update::new(), None).unwrap();

    let mut update = Update::new();
    update.created_accounts.push(address);
    update.nonces.push((address, 1));
    archive.add(1, &update, None).unwrap();

    assert_eq!(archive.get_account(0, &address).unwrap(), None);
    assert_eq!(archive.get_account(1, &address).unwrap().unwrap().nonce, 1);
}

#[test]
fn reopening_an_archive_resumes_from_the_last_recorded_block() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::repeat_byte(3);
    {
        let mut archive = ArchiveTrie::open(dir.path(), test_config()).unwrap();
        let mut update = Update::new();
        update.created_accounts.push(address);
        update.balances.push((address, U256::from(77u64)));
        archive.add(0, &update, None).unwrap();
        archive.add(1, &Update::new(), None).unwrap();
        archive.close().unwrap();
    }

    let archive = ArchiveTrie::open(dir.path(), test_config()).unwrap();
    assert_eq!(archive.get_block_height(), Some(1));
    assert_eq!(archive.get_account(1, &address).unwrap().unwrap().balance, U256::from(77u64));
}

#[test]
fn precomputed_root_hash_is_trusted_without_recomputation() {
    let dir_live = tempfile::tempdir().unwrap();
    let dir_archive = tempfile::tempdir().unwrap();
    let mut live = state_trie::LiveTrie::open(dir_live.path(), Configuration::live_with_node()).unwrap();
    let mut archive = ArchiveTrie::open(dir_archive.path(), test_config()).unwrap();

    let address = Address::repeat_byte(4);
    let mut update = Update::new();
    update.created_accounts.push(address);
    update.balances.push((address, U256::from(5u64)));

    live.apply_update(&update).unwrap();
    let (hash, _) = live.update_hashes().unwrap();

    let (_, recorded_hash) = archive.add(0, &update, Some(hash)).unwrap();
    assert_eq!(recorded_hash, hash);
}

#[test]
fn empty_update_leaves_the_root_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = ArchiveTrie::open(dir.path(), test_config()).unwrap();
    let address = Address::repeat_byte(6);
    let mut update = Update::new();
    update.created_accounts.push(address);
    update.nonces.push((address, 9));
    let (root_before, hash_before) = archive.add(0, &update, None).unwrap();

    let (root_after, hash_after) = archive.add(1, &Update::new(), None).unwrap();
    assert_eq!(root_before, root_after);
    assert_eq!(hash_before, hash_after);
}

#[test]
fn account_info_defaults_are_not_mistaken_for_an_account() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = ArchiveTrie::open(dir.path(), test_config()).unwrap();
    let never_created = Address::repeat_byte(7);
    archive.add(0, &Update::new(), None).unwrap();
    assert_eq!(archive.get_account(0, &never_created).unwrap(), None::<AccountInfo>);
    let _ = Hash::zero();
}
