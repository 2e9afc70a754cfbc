//! §4.4: canonical encoding and hashing. Node content is translated into the classic
//! Ethereum MPT RLP shape and hashed with Keccak-256; children whose encoding is shorter
//! than 32 bytes are embedded inline rather than referenced by hash.
//!
//! This module is intentionally node-at-a-time: it has no notion of a node store. Bottom-up
//! traversal over the dirty set, and stitching each node's [`ChildRef`] outcome into its
//! parent, is [`crate::forest::Forest::update_hashes`]'s job.

use std::collections::HashMap;

use sha3::{Digest, Keccak256};
use state_rlp::{encode_list, RLPEncode, EMPTY_STRING};

use crate::nibble::Nibbles;
use crate::node_id::NodeId;
use crate::types::{empty_code_hash, AccountInfo, Hash, Value};

/// A child's contribution to its parent's encoding: either a 32-byte hash reference or its
/// encoding embedded verbatim (§4.4, "embedded children").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildRef {
    Empty,
    Hash(Hash),
    Embedded(Vec<u8>),
}

impl ChildRef {
    /// The bytes this reference contributes to its parent's RLP list: a length-prefixed
    /// hash string, or the embedded item's own encoding spliced in directly.
    fn rlp_item(&self) -> Vec<u8> {
        match self {
            ChildRef::Empty => EMPTY_STRING.to_vec(),
            ChildRef::Hash(h) => h.as_bytes().to_vec().encode_to_vec(),
            ChildRef::Embedded(bytes) => bytes.clone(),
        }
    }
}

/// Maps every node whose hash was (re)computed during a single `update_hashes` pass to its
/// fresh hash, so a sibling trie (e.g. the archive) can reuse them instead of recomputing
/// (§4.9, "precomputed hints").
pub type HashHints = HashMap<NodeId, Hash>;

fn keccak(bytes: &[u8]) -> Hash {
    Hash::from_slice(Keccak256::new().chain_update(bytes).finalize().as_slice())
}

/// Stateless canonical encoder/hasher. Zero-sized; exists so call sites read like the rest
/// of the crate's component structs and so `#[tracing::instrument]` has a receiver to attach to.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hasher;

impl Hasher {
    /// Classifies an already-RLP-encoded node by size: below 32 bytes it is embedded in its
    /// parent, otherwise it is referenced by its Keccak-256 hash.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn classify(&self, encoded: &[u8]) -> ChildRef {
        if encoded.len() < 32 {
            ChildRef::Embedded(encoded.to_vec())
        } else {
            ChildRef::Hash(keccak(encoded))
        }
    }

    /// Keccak-256 of an encoding, used for the root hash (which is never embedded,
    /// regardless of size) and by [`Self::classify`].
    pub fn hash_of(&self, encoded: &[u8]) -> Hash {
        keccak(encoded)
    }

    /// Encodes the canonical "empty trie" node: a bare RLP empty string.
    pub fn encode_empty(&self) -> Vec<u8> {
        EMPTY_STRING.to_vec()
    }

    /// Encodes a branch as a 17-element RLP list: one item per nibble slot plus a trailing
    /// value slot, which this trie never populates (leaves always live one level below any
    /// branch), so it is always the empty string.
    #[tracing::instrument(level = "trace", skip(self, children))]
    pub fn encode_branch(&self, children: &[ChildRef; 16]) -> Vec<u8> {
        let mut items: Vec<Vec<u8>> = children.iter().map(ChildRef::rlp_item).collect();
        items.push(EMPTY_STRING.to_vec());
        let mut buf = Vec::new();
        encode_list(&items, &mut buf);
        buf
    }

    /// Encodes an extension as a 2-element RLP list: the compact-encoded prefix and the
    /// single child reference.
    #[tracing::instrument(level = "trace", skip(self, prefix, child))]
    pub fn encode_extension(&self, prefix: &Nibbles, child: &ChildRef) -> Vec<u8> {
        let items = vec![prefix.encode_compact(), child.rlp_item()];
        let mut buf = Vec::new();
        encode_list(&items, &mut buf);
        buf
    }

    /// Encodes an account leaf as `[compact(suffix), rlp([nonce, balance, storage_root,
    /// code_hash])]`, the classic Ethereum state-account encoding. `storage_root` must
    /// already be a [`ChildRef::Hash`] (never [`ChildRef::Empty`] or `Embedded`): a
    /// storage root is a cross-trie hash reference, not a regular child slot, so the
    /// caller (`Forest::encode_node`) is responsible for substituting the empty-trie hash
    /// and for never embedding it regardless of encoded size.
    #[tracing::instrument(level = "trace", skip(self, suffix, info, storage_root))]
    pub fn encode_account_leaf(&self, suffix: &Nibbles, info: &AccountInfo, storage_root: &ChildRef) -> Vec<u8> {
        // A zero `code_hash` is this engine's own "no code" sentinel; the mainstream
        // Ethereum-compatible encoding for that case is keccak256(""), not the zero hash.
        let code_hash = if info.code_hash.is_zero() {
            empty_code_hash()
        } else {
            info.code_hash
        };
        let account_items = vec![
            info.nonce.encode_to_vec(),
            info.balance.to_big_endian_vec().encode_to_vec(),
            storage_root.rlp_item(),
            code_hash.as_bytes().to_vec().encode_to_vec(),
        ];
        let mut account_buf = Vec::new();
        encode_list(&account_items, &mut account_buf);

        let items = vec![suffix.encode_compact(), account_buf];
        let mut buf = Vec::new();
        encode_list(&items, &mut buf);
        buf
    }

    /// Encodes a storage-value leaf as `[compact(suffix), rlp(value)]`.
    #[tracing::instrument(level = "trace", skip(self, suffix, value))]
    pub fn encode_value_leaf(&self, suffix: &Nibbles, value: &Value) -> Vec<u8> {
        let items = vec![suffix.encode_compact(), value.as_bytes().to_vec().encode_to_vec()];
        let mut buf = Vec::new();
        encode_list(&items, &mut buf);
        buf
    }
}

/// Minimal big-endian helper kept local to the hasher: `U256::to_big_endian` writes into a
/// caller-owned buffer, which the RLP integer encoder needs as an owned, trimmable slice.
trait ToBigEndianVec {
    fn to_big_endian_vec(&self) -> Vec<u8>;
}

impl ToBigEndianVec for ethereum_types::U256 {
    fn to_big_endian_vec(&self) -> Vec<u8> {
        let mut buf = [0u8; 32];
        self.to_big_endian(&mut buf);
        buf.to_vec()
    }
}
