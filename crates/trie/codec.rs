//! §4.2: translates between in-memory [`crate::node::Node`] variants and the fixed-width
//! byte records [`crate::stock::Stock`] persists, according to the two-axis configuration
//! (`HashStorageLocation`, `TrackSuffixLengthsInLeafNodes`) chosen at open time.
//!
//! This is *not* the canonical hash encoding of §4.4 — that one lives in [`crate::hasher`]
//! and uses the MPT "compact" nibble format. Here, extension paths are packed as a plain
//! length-prefixed nibble buffer sized for the worst case (64 nibbles), since `Stock`
//! records must be a fixed width regardless of the path they happen to carry.

use ethereum_types::U256;

use crate::config::{Configuration, HashStorageLocation};
use crate::error::{Result, StateError};
use crate::nibble::Nibbles;
use crate::node::{AccountNode, BranchNode, ChildSlot, ExtensionNode, Node, ValueNode};
use crate::node_id::{NodeId, NodeKind};
use crate::types::{AccountInfo, Address, Hash, Key, Value};

/// Maximum nibble-path length: hashed addresses/keys are 32 bytes, i.e. 64 nibbles.
const MAX_PATH_NIBBLES: usize = 64;
/// Fixed on-disk width of a packed nibble path: 1 length byte + `ceil(64/2)` packed bytes.
const PATH_FIELD_WIDTH: usize = 1 + MAX_PATH_NIBBLES / 2;

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    pub hash_storage_location: HashStorageLocation,
    pub track_suffix_lengths: bool,
}

impl Codec {
    pub fn from_config(cfg: &Configuration) -> Self {
        Self {
            hash_storage_location: cfg.hash_storage_location,
            track_suffix_lengths: cfg.track_suffix_lengths,
        }
    }

    fn with_parent(&self) -> bool {
        matches!(self.hash_storage_location, HashStorageLocation::WithParent)
    }

    fn with_node(&self) -> bool {
        matches!(self.hash_storage_location, HashStorageLocation::WithNode)
    }

    /// Width, in bytes, of one child reference field: an 8-byte id, plus a 32-byte cached
    /// hash when `HashStorageLocation::WithParent`.
    fn child_ref_width(&self) -> usize {
        8 + if self.with_parent() { 32 } else { 0 }
    }

    /// Width, in bytes, of the own-hash + dirty-bit trailer written in `WithNode` mode.
    fn own_hash_width(&self) -> usize {
        if self.with_node() { 32 + 1 } else { 0 }
    }

    fn suffix_len_width(&self) -> usize {
        if self.track_suffix_lengths { 1 } else { 0 }
    }

    pub fn width(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Empty => 0,
            NodeKind::Branch => 16 * self.child_ref_width() + self.own_hash_width(),
            NodeKind::Extension => PATH_FIELD_WIDTH + self.child_ref_width() + self.own_hash_width(),
            NodeKind::Account => {
                self.suffix_len_width()
                    + 20 // address
                    + 8 // nonce
                    + 32 // balance
                    + 32 // code hash
                    + self.child_ref_width() // storage root
                    + self.own_hash_width()
            }
            NodeKind::Value => {
                self.suffix_len_width() + 32 /* key */ + 32 /* value */ + self.own_hash_width()
            }
        }
    }

    fn write_child_ref(&self, buf: &mut Vec<u8>, slot: &ChildSlot) {
        buf.extend_from_slice(&slot.id.as_u64().to_le_bytes());
        if self.with_parent() {
            buf.extend_from_slice(slot.cached_hash.unwrap_or_default().as_bytes());
        }
    }

    fn read_child_ref(&self, buf: &[u8], pos: &mut usize) -> ChildSlot {
        let id = NodeId::from_u64(u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap()));
        *pos += 8;
        let mut slot = ChildSlot::new(id);
        if self.with_parent() {
            let hash = Hash::from_slice(&buf[*pos..*pos + 32]);
            *pos += 32;
            if !id.is_empty() {
                slot.cached_hash = Some(hash);
            }
        }
        slot
    }

    fn write_own_hash(&self, buf: &mut Vec<u8>, hash: Option<Hash>) {
        if self.with_node() {
            buf.extend_from_slice(hash.unwrap_or_default().as_bytes());
            buf.push(u8::from(hash.is_none()));
        }
    }

    fn read_own_hash(&self, buf: &[u8], pos: &mut usize) -> Option<Hash> {
        if !self.with_node() {
            return None;
        }
        let hash = Hash::from_slice(&buf[*pos..*pos + 32]);
        let dirty = buf[*pos + 32] != 0;
        *pos += 33;
        (!dirty).then_some(hash)
    }

    fn write_path(&self, buf: &mut Vec<u8>, path: &Nibbles) {
        assert!(path.len() <= MAX_PATH_NIBBLES, "path exceeds 64 nibbles");
        buf.push(path.len() as u8);
        let mut packed = vec![0u8; MAX_PATH_NIBBLES / 2];
        for (i, chunk) in path.as_slice().chunks(2).enumerate() {
            let hi = chunk[0];
            let lo = chunk.get(1).copied().unwrap_or(0);
            packed[i] = (hi << 4) | lo;
        }
        buf.extend_from_slice(&packed);
    }

    fn read_path(&self, buf: &[u8], pos: &mut usize) -> Nibbles {
        let len = buf[*pos] as usize;
        let packed = &buf[*pos + 1..*pos + 1 + MAX_PATH_NIBBLES / 2];
        let mut nibbles = Vec::with_capacity(len);
        for (i, byte) in packed.iter().enumerate() {
            if nibbles.len() < len {
                nibbles.push(byte >> 4);
            }
            if nibbles.len() < len {
                nibbles.push(byte & 0x0f);
            }
            let _ = i;
        }
        *pos += PATH_FIELD_WIDTH;
        Nibbles::from_hex(nibbles)
    }

    pub fn encode_branch(&self, node: &BranchNode, own_hash: Option<Hash>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.width(NodeKind::Branch));
        for slot in &node.children {
            self.write_child_ref(&mut buf, slot);
        }
        self.write_own_hash(&mut buf, own_hash);
        buf
    }

    pub fn decode_branch(&self, buf: &[u8]) -> Result<(BranchNode, Option<Hash>)> {
        self.expect_width(buf, NodeKind::Branch)?;
        let mut pos = 0;
        let children: [ChildSlot; 16] = std::array::from_fn(|_| {
            let slot = self.read_child_ref(buf, &mut pos);
            slot
        });
        let own_hash = self.read_own_hash(buf, &mut pos);
        Ok((BranchNode { children }, own_hash))
    }

    pub fn encode_extension(&self, node: &ExtensionNode, own_hash: Option<Hash>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.width(NodeKind::Extension));
        self.write_path(&mut buf, &node.prefix);
        self.write_child_ref(&mut buf, &node.child);
        self.write_own_hash(&mut buf, own_hash);
        buf
    }

    pub fn decode_extension(&self, buf: &[u8]) -> Result<(ExtensionNode, Option<Hash>)> {
        self.expect_width(buf, NodeKind::Extension)?;
        let mut pos = 0;
        let prefix = self.read_path(buf, &mut pos);
        let child = self.read_child_ref(buf, &mut pos);
        let own_hash = self.read_own_hash(buf, &mut pos);
        Ok((ExtensionNode { prefix, child }, own_hash))
    }

    pub fn encode_account(&self, node: &AccountNode, own_hash: Option<Hash>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.width(NodeKind::Account));
        if self.track_suffix_lengths {
            buf.push(node.suffix_len);
        }
        buf.extend_from_slice(node.address.as_bytes());
        buf.extend_from_slice(&node.info.nonce.to_le_bytes());
        let mut balance_be = [0u8; 32];
        node.info.balance.to_big_endian(&mut balance_be);
        buf.extend_from_slice(&balance_be);
        buf.extend_from_slice(node.info.code_hash.as_bytes());
        self.write_child_ref(&mut buf, &node.storage_root);
        self.write_own_hash(&mut buf, own_hash);
        buf
    }

    pub fn decode_account(&self, buf: &[u8]) -> Result<(AccountNode, Option<Hash>)> {
        self.expect_width(buf, NodeKind::Account)?;
        let mut pos = 0;
        let suffix_len = if self.track_suffix_lengths {
            let v = buf[pos];
            pos += 1;
            v
        } else {
            0
        };
        let address = Address::from_slice(&buf[pos..pos + 20]);
        pos += 20;
        let nonce = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let balance = U256::from_big_endian(&buf[pos..pos + 32]);
        pos += 32;
        let code_hash = Hash::from_slice(&buf[pos..pos + 32]);
        pos += 32;
        let storage_root = self.read_child_ref(buf, &mut pos);
        let own_hash = self.read_own_hash(buf, &mut pos);
        Ok((
            AccountNode {
                suffix_len,
                address,
                info: AccountInfo::new(nonce, balance, code_hash),
                storage_root,
            },
            own_hash,
        ))
    }

    pub fn encode_value(&self, node: &ValueNode, own_hash: Option<Hash>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.width(NodeKind::Value));
        if self.track_suffix_lengths {
            buf.push(node.suffix_len);
        }
        buf.extend_from_slice(node.key.as_bytes());
        buf.extend_from_slice(node.value.as_bytes());
        self.write_own_hash(&mut buf, own_hash);
        buf
    }

    pub fn decode_value(&self, buf: &[u8]) -> Result<(ValueNode, Option<Hash>)> {
        self.expect_width(buf, NodeKind::Value)?;
        let mut pos = 0;
        let suffix_len = if self.track_suffix_lengths {
            let v = buf[pos];
            pos += 1;
            v
        } else {
            0
        };
        let key = Key::from_slice(&buf[pos..pos + 32]);
        pos += 32;
        let value = Value::from_slice(&buf[pos..pos + 32]);
        pos += 32;
        let own_hash = self.read_own_hash(buf, &mut pos);
        Ok((ValueNode { suffix_len, key, value }, own_hash))
    }

    /// Encodes any node, dispatching on its kind.
    pub fn encode(&self, node: &Node, own_hash: Option<Hash>) -> Vec<u8> {
        match node {
            Node::Branch(n) => self.encode_branch(n, own_hash),
            Node::Extension(n) => self.encode_extension(n, own_hash),
            Node::Account(n) => self.encode_account(n, own_hash),
            Node::Value(n) => self.encode_value(n, own_hash),
        }
    }

    pub fn decode(&self, kind: NodeKind, buf: &[u8]) -> Result<(Node, Option<Hash>)> {
        Ok(match kind {
            NodeKind::Branch => {
                let (n, h) = self.decode_branch(buf)?;
                (Node::Branch(n), h)
            }
            NodeKind::Extension => {
                let (n, h) = self.decode_extension(buf)?;
                (Node::Extension(n), h)
            }
            NodeKind::Account => {
                let (n, h) = self.decode_account(buf)?;
                (Node::Account(n), h)
            }
            NodeKind::Value => {
                let (n, h) = self.decode_value(buf)?;
                (Node::Value(n), h)
            }
            NodeKind::Empty => {
                return Err(StateError::CorruptionDetected(
                    "attempted to decode the Empty node kind, which owns no stock record".into(),
                ));
            }
        })
    }

    fn expect_width(&self, buf: &[u8], kind: NodeKind) -> Result<()> {
        let expected = self.width(kind);
        if buf.len() != expected {
            return Err(StateError::CorruptionDetected(format!(
                "{:?} record has {} bytes, expected {}",
                kind,
                buf.len(),
                expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn branch_with_two_children() -> BranchNode {
        let mut b = BranchNode::empty();
        b.children[0] = ChildSlot::new(NodeId::new(NodeKind::Value, 1));
        b.children[0].cached_hash = Some(Hash::repeat_byte(0xaa));
        b.children[5] = ChildSlot::new(NodeId::new(NodeKind::Value, 2));
        b
    }

    #[test]
    fn branch_round_trips_with_node() {
        let codec = Codec::from_config(&Configuration::live_with_node());
        let branch = branch_with_two_children();
        let bytes = codec.encode_branch(&branch, Some(Hash::repeat_byte(0x11)));
        assert_eq!(bytes.len(), codec.width(NodeKind::Branch));
        let (decoded, hash) = codec.decode_branch(&bytes).unwrap();
        assert_eq!(decoded.children[0].id, branch.children[0].id);
        assert_eq!(hash, Some(Hash::repeat_byte(0x11)));
    }

    #[test]
    fn branch_round_trips_with_parent() {
        let codec = Codec::from_config(&Configuration::archive_with_parent());
        let branch = branch_with_two_children();
        let bytes = codec.encode_branch(&branch, None);
        let (decoded, _) = codec.decode_branch(&bytes).unwrap();
        assert_eq!(decoded.children[0].cached_hash, Some(Hash::repeat_byte(0xaa)));
        assert_eq!(decoded.children[5].cached_hash, None);
    }

    #[test]
    fn extension_path_round_trips() {
        let codec = Codec::from_config(&Configuration::live_with_node());
        let ext = ExtensionNode {
            prefix: Nibbles::from_hex(vec![1, 2, 3]),
            child: ChildSlot::new(NodeId::new(NodeKind::Branch, 7)),
        };
        let bytes = codec.encode_extension(&ext, Some(Hash::zero()));
        let (decoded, _) = codec.decode_extension(&bytes).unwrap();
        assert_eq!(decoded.prefix, ext.prefix);
        assert_eq!(decoded.child.id, ext.child.id);
    }

    #[test]
    fn account_round_trips() {
        let codec = Codec::from_config(&Configuration::archive_with_parent());
        let account = AccountNode {
            suffix_len: 64,
            address: Address::repeat_byte(0x42),
            info: AccountInfo::new(7, U256::from(99), Hash::repeat_byte(0x55)),
            storage_root: ChildSlot::new(NodeId::EMPTY),
        };
        let bytes = codec.encode_account(&account, None);
        let (decoded, _) = codec.decode_account(&bytes).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn value_round_trips() {
        let codec = Codec::from_config(&Configuration::live_with_node());
        let value = ValueNode {
            suffix_len: 0,
            key: Key::repeat_byte(0x01),
            value: Value::repeat_byte(0x02),
        };
        let bytes = codec.encode_value(&value, Some(Hash::repeat_byte(0x9)));
        let (decoded, hash) = codec.decode_value(&bytes).unwrap();
        assert_eq!(decoded.key, value.key);
        assert_eq!(hash, Some(Hash::repeat_byte(0x9)));
    }
}
