//! The entities of §3.1: addresses, keys, values, hashes, balances and account records.

use ethereum_types::{H160, H256, U256};

/// 20-byte account address.
pub type Address = H160;
/// 32-byte storage key.
pub type Key = H256;
/// 32-byte storage value.
pub type Value = H256;
/// 32-byte cryptographic hash (node hash, code hash, storage/state root).
pub type Hash = H256;
/// Account balance, a 32-byte unsigned integer.
pub type Balance = U256;
/// Account nonce.
pub type Nonce = u64;

/// `(Nonce, Balance, CodeHash)`. An account is *empty* iff all three fields are zero/default;
/// empty accounts are never stored (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountInfo {
    pub nonce: Nonce,
    pub balance: Balance,
    pub code_hash: Hash,
}

impl AccountInfo {
    pub const fn new(nonce: Nonce, balance: Balance, code_hash: Hash) -> Self {
        Self {
            nonce,
            balance,
            code_hash,
        }
    }

    /// An account is empty iff nonce, balance and code hash are all zero.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash.is_zero()
    }
}

/// Keccak-256 of an empty byte slice's RLP encoding: the hash of the Empty trie node.
pub fn empty_trie_hash() -> Hash {
    use sha3::{Digest, Keccak256};
    H256::from_slice(
        Keccak256::new()
            .chain_update(state_rlp::EMPTY_STRING)
            .finalize()
            .as_slice(),
    )
}

/// Keccak-256 of an arbitrary byte slice, used to derive hashed-address and hashed-key paths.
pub fn keccak256(data: impl AsRef<[u8]>) -> Hash {
    use sha3::{Digest, Keccak256};
    H256::from_slice(Keccak256::new().chain_update(data.as_ref()).finalize().as_slice())
}

/// Keccak-256 of the empty byte string: the canonical `codeHash` for an account with no
/// code. Accounts in this engine store a zero `code_hash` as their own "no code" sentinel
/// (`AccountInfo::is_empty`'s definition of emptiness relies on it); this is the value that
/// sentinel must be translated to wherever an account leaf is canonically encoded.
pub fn empty_code_hash() -> Hash {
    keccak256(b"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_account_info_is_empty() {
        assert!(AccountInfo::default().is_empty());
        assert!(!AccountInfo::new(1, Balance::zero(), Hash::zero()).is_empty());
    }

    #[test]
    fn keccak_is_deterministic() {
        assert_eq!(keccak256(b"hello"), keccak256(b"hello"));
        assert_ne!(keccak256(b"hello"), keccak256(b"world"));
    }
}
