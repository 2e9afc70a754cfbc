//! §6.3: the batch of changes applied to a trie for one block. Order is fixed by the
//! external contract, not chosen by the engine: created accounts clear any pre-existing
//! storage before per-field writes apply, and deletions are applied last.

use crate::types::{AccountInfo, Address, Key, Value};

#[derive(Debug, Clone, Default)]
pub struct Update {
    pub created_accounts: Vec<Address>,
    pub deleted_accounts: Vec<Address>,
    pub balances: Vec<(Address, ethereum_types::U256)>,
    pub nonces: Vec<(Address, u64)>,
    pub codes: Vec<(Address, crate::types::Hash)>,
    pub slots: Vec<(Address, Key, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.created_accounts.is_empty()
            && self.deleted_accounts.is_empty()
            && self.balances.is_empty()
            && self.nonces.is_empty()
            && self.codes.is_empty()
            && self.slots.is_empty()
    }
}

/// Applies `update` to a trie through the four primitives every trie façade exposes,
/// in the order the external contract fixes (§5): created accounts first (clearing any
/// pre-existing storage), then per-field writes, then deletions.
pub trait ApplyUpdate {
    fn get_or_create_account(&mut self, address: Address) -> crate::error::Result<AccountInfo>;
    fn put_account(&mut self, address: Address, info: AccountInfo) -> crate::error::Result<()>;
    fn clear_storage(&mut self, address: Address) -> crate::error::Result<()>;
    fn put_slot(&mut self, address: Address, key: Key, value: Value) -> crate::error::Result<()>;
    fn delete_account(&mut self, address: Address) -> crate::error::Result<()>;
}

pub fn apply_update(trie: &mut impl ApplyUpdate, update: &Update) -> crate::error::Result<()> {
    for &address in &update.created_accounts {
        trie.clear_storage(address)?;
        trie.put_account(address, AccountInfo::default())?;
    }
    for &(address, balance) in &update.balances {
        let mut info = trie.get_or_create_account(address)?;
        info.balance = balance;
        trie.put_account(address, info)?;
    }
    for &(address, nonce) in &update.nonces {
        let mut info = trie.get_or_create_account(address)?;
        info.nonce = nonce;
        trie.put_account(address, info)?;
    }
    for &(address, code_hash) in &update.codes {
        let mut info = trie.get_or_create_account(address)?;
        info.code_hash = code_hash;
        trie.put_account(address, info)?;
    }
    for &(address, key, value) in &update.slots {
        trie.put_slot(address, key, value)?;
    }
    for &address in &update.deleted_accounts {
        trie.delete_account(address)?;
    }
    Ok(())
}
