//! §4.8: a thin façade around a Mutable-mode [`Forest`] holding the single current root.
//! All mutations go through the forest and fold its possibly-new root back into `self`;
//! the root is persisted to a small `root.dat` on close so a fresh `open` can resume
//! exactly where the previous session left off.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Configuration;
use crate::error::{Result, StateError};
use crate::forest::Forest;
use crate::hasher::HashHints;
use crate::node_id::NodeId;
use crate::types::{AccountInfo, Address, Hash, Key, Value};
use crate::update::{apply_update, ApplyUpdate, Update};

const ROOT_FILE: &str = "root.dat";

/// Single-version mutable trie (§4.8). Not `Clone`: owns the one [`Forest`] for its
/// directory, same as `Forest` itself.
pub struct LiveTrie {
    forest: Forest,
    root: NodeId,
}

impl LiveTrie {
    #[tracing::instrument(level = "info", skip(config), fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, config: Configuration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let root = read_root(&dir)?;
        let forest = Forest::open(&dir, config)?;
        Ok(Self { forest, root })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get_account(&self, address: &Address) -> Result<Option<AccountInfo>> {
        self.forest.get_account(self.root, address)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_account(&mut self, address: &Address, info: AccountInfo) -> Result<()> {
        self.root = self.forest.set_account(self.root, address, info)?;
        Ok(())
    }

    pub fn get_value(&self, address: &Address, key: &Key) -> Result<Option<Value>> {
        let storage_root = self.forest.get_account_storage_root(self.root, address)?;
        self.forest.get_value(storage_root, key)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_value(&mut self, address: &Address, key: &Key, value: Value) -> Result<()> {
        let storage_root = self.forest.get_account_storage_root(self.root, address)?;
        let new_storage_root = self.forest.set_value(storage_root, key, value)?;
        self.root = self.forest.set_account_storage_root(self.root, address, new_storage_root)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn clear_storage(&mut self, address: &Address) -> Result<()> {
        self.root = self.forest.clear_storage(self.root, address)?;
        Ok(())
    }

    /// Applies a whole block's worth of changes in the fixed order §5/§6.3 requires.
    pub fn apply_update(&mut self, update: &Update) -> Result<()> {
        apply_update(self, update)
    }

    /// Recomputes the root hash and a hint map a companion archive can reuse (§4.9).
    #[tracing::instrument(level = "info", skip(self))]
    pub fn update_hashes(&self) -> Result<(Hash, HashHints)> {
        self.forest.update_hashes(self.root)
    }

    pub fn check(&self) -> Result<()> {
        self.forest.check(self.root)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn flush(&self) -> Result<()> {
        self.forest.flush()?;
        write_root(self.forest.dir(), self.root)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn close(self) -> Result<()> {
        write_root(self.forest.dir(), self.root)?;
        self.forest.close()
    }
}

impl ApplyUpdate for LiveTrie {
    fn get_or_create_account(&mut self, address: Address) -> Result<AccountInfo> {
        Ok(self.get_account(&address)?.unwrap_or_default())
    }

    fn put_account(&mut self, address: Address, info: AccountInfo) -> Result<()> {
        self.set_account(&address, info)
    }

    fn clear_storage(&mut self, address: Address) -> Result<()> {
        LiveTrie::clear_storage(self, &address)
    }

    fn put_slot(&mut self, address: Address, key: Key, value: Value) -> Result<()> {
        self.set_value(&address, &key, value)
    }

    fn delete_account(&mut self, address: Address) -> Result<()> {
        self.set_account(&address, AccountInfo::default())
    }
}

fn read_root(dir: &Path) -> Result<NodeId> {
    let path = dir.join(ROOT_FILE);
    if !path.exists() {
        return Ok(NodeId::EMPTY);
    }
    let raw = fs::read(&path)?;
    if raw.len() != 8 {
        return Err(StateError::CorruptionDetected(format!(
            "{:?} is {} bytes, expected 8",
            path,
            raw.len()
        )));
    }
    Ok(NodeId::from_u64(u64::from_le_bytes(raw.try_into().unwrap())))
}

fn write_root(dir: &Path, root: NodeId) -> Result<()> {
    fs::write(dir.join(ROOT_FILE), root.as_u64().to_le_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::U256;

    fn test_config() -> Configuration {
        let mut cfg = Configuration::live_with_node();
        cfg.node_cache_capacity = 64;
        cfg.hash_cache_capacity = 64;
        cfg.write_buffer_capacity = 8;
        cfg
    }

    #[test]
    fn fresh_directory_opens_with_an_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let trie = LiveTrie::open(dir.path(), test_config()).unwrap();
        assert_eq!(trie.root(), NodeId::EMPTY);
    }

    #[test]
    fn set_account_and_reopen_preserves_root_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::repeat_byte(1);
        let info = AccountInfo::new(3, U256::from(30u64), Hash::zero());
        {
            let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
            trie.set_account(&address, info).unwrap();
            trie.close().unwrap();
        }
        let trie = LiveTrie::open(dir.path(), test_config()).unwrap();
        assert_eq!(trie.get_account(&address).unwrap(), Some(info));
    }

    #[test]
    fn set_value_round_trips_through_the_owning_account() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::repeat_byte(2);
        let key = Key::repeat_byte(9);
        let value = Value::repeat_byte(7);
        let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
        trie.set_account(&address, AccountInfo::new(1, U256::zero(), Hash::zero())).unwrap();
        trie.set_value(&address, &key, value).unwrap();
        assert_eq!(trie.get_value(&address, &key).unwrap(), Some(value));
    }

    #[test]
    fn apply_update_runs_the_fixed_field_order() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::repeat_byte(3);
        let mut update = Update::new();
        update.created_accounts.push(address);
        update.balances.push((address, U256::from(5u64)));
        update.nonces.push((address, 2));

        let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
        trie.apply_update(&update).unwrap();
        let info = trie.get_account(&address).unwrap().unwrap();
        assert_eq!(info.balance, U256::from(5u64));
        assert_eq!(info.nonce, 2);
    }

    #[test]
    fn apply_update_deletes_accounts_last() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::repeat_byte(4);
        let mut trie = LiveTrie::open(dir.path(), test_config()).unwrap();
        trie.set_account(&address, AccountInfo::new(1, U256::from(1u64), Hash::zero())).unwrap();

        let mut update = Update::new();
        update.deleted_accounts.push(address);
        trie.apply_update(&update).unwrap();

        assert_eq!(trie.get_account(&address).unwrap(), None);
    }
}
