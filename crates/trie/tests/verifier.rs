//! End-to-end `Verifier` scenarios driven through the public `LiveTrie`/`ArchiveTrie`
//! façades rather than `Forest` directly, since `Forest` itself is crate-private.

use ethereum_types::U256;
use state_trie::{AccountInfo, Address, Configuration, Hash, LiveTrie};

fn test_config() -> Configuration {
    let mut cfg = Configuration::live_with_node();
    cfg.node_cache_capacity = 128;
    cfg.hash_cache_capacity = 128;
    cfg.write_buffer_capacity = 16;
    cfg
}

#[test]
fn check_passes_on_a_freshly_built_trie() {
    let dir = tempfile::tempdir().unwrap();
    let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    for i in 0..20u8 {
        trie.set_account(&Address::repeat_byte(i), AccountInfo::new(i as u64, U256::from(i), Hash::zero()))
            .unwrap();
    }
    trie.check().unwrap();
}

#[test]
fn check_passes_after_deletions_and_reopening() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
        for i in 0..10u8 {
            trie.set_account(&Address::repeat_byte(i), AccountInfo::new(1, U256::from(i), Hash::zero()))
                .unwrap();
        }
        let mut update = state_trie::Update::new();
        update.deleted_accounts.push(Address::repeat_byte(3));
        trie.apply_update(&update).unwrap();
        trie.close().unwrap();
    }
    let trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    trie.check().unwrap();
    assert_eq!(trie.get_account(&Address::repeat_byte(3)).unwrap(), None);
}

#[test]
fn update_hashes_is_stable_across_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::repeat_byte(42);
    let hash_before = {
        let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
        trie.set_account(&address, AccountInfo::new(1, U256::from(1u64), Hash::zero())).unwrap();
        let (hash, _) = trie.update_hashes().unwrap();
        trie.close().unwrap();
        hash
    };
    let trie = LiveTrie::open(dir.path(), test_config()).unwrap();
    let (hash_after, _) = trie.update_hashes().unwrap();
    assert_eq!(hash_before, hash_after);
}
