//! §3.2: the five node variants and the invariants a structural rewrite must preserve.
//!
//! This module only describes *shape*: dirtiness, hash-freshness and frozen-ness are
//! properties of the shared handle the [`crate::forest`] hands out, not of `Node` itself
//! (§10, "dirty bit placement").

use crate::nibble::Nibbles;
use crate::node_id::{NodeId, NodeKind};
use crate::types::{AccountInfo, Address, Hash, Key, Value};

/// A reference to a child subtree, carrying a hash/embedding cache the hasher fills in
/// (§4.4). `id == NodeId::EMPTY` means the slot holds the canonical empty subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildSlot {
    pub id: NodeId,
    /// The child's hash, if it has been computed since the child was last made dirty.
    pub cached_hash: Option<Hash>,
    /// Whether the child's canonical encoding is short enough to be embedded verbatim in
    /// the parent rather than referenced by hash (§4.4).
    pub embedded: bool,
}

impl ChildSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            cached_hash: None,
            embedded: false,
        }
    }

    /// Invalidates the cached hash, e.g. because the child was just rewritten.
    pub fn invalidate(&mut self) {
        self.cached_hash = None;
        self.embedded = false;
    }
}

/// 16 child slots, one per nibble. The no-empty-branches invariant (§3.4) requires at
/// least 2 non-empty slots at all times; structural rewrites in [`crate::forest`] enforce
/// this by collapsing branches that fall below the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchNode {
    pub children: [ChildSlot; 16],
}

impl BranchNode {
    pub fn empty() -> Self {
        Self {
            children: Default::default(),
        }
    }

    pub fn non_empty_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
    }

    /// Returns the index of the only non-empty child, if exactly one exists.
    pub fn single_child(&self) -> Option<(usize, &ChildSlot)> {
        let mut iter = self
            .children
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_empty());
        let first = iter.next()?;
        if iter.next().is_some() {
            None
        } else {
            Some(first)
        }
    }
}

/// A non-empty path fragment and a single next-child (§3.2). No-degenerate-extensions
/// (§3.4) requires `prefix.len() >= 1` and that `child` never itself be an Extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionNode {
    pub prefix: Nibbles,
    pub child: ChildSlot,
}

/// An account leaf, reached via the full 64-nibble hashed-address path (§3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountNode {
    /// Length, in nibbles, of the path suffix still needed to reach this leaf from its
    /// parent. Only meaningful (and persisted) when `TrackSuffixLengthsInLeafNodes` is set.
    pub suffix_len: u8,
    pub address: Address,
    pub info: AccountInfo,
    /// Root of this account's independent storage subtree.
    pub storage_root: ChildSlot,
}

/// A storage-slot leaf, reached via the full 64-nibble hashed-key path (§3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueNode {
    pub suffix_len: u8,
    pub key: Key,
    pub value: Value,
}

/// The sum type over the four non-Empty node kinds. `NodeId::EMPTY` stands in for the
/// fifth, canonical Empty node, which owns no storage and is never materialized here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Branch(BranchNode),
    Extension(ExtensionNode),
    Account(AccountNode),
    Value(ValueNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Branch(_) => NodeKind::Branch,
            Node::Extension(_) => NodeKind::Extension,
            Node::Account(_) => NodeKind::Account,
            Node::Value(_) => NodeKind::Value,
        }
    }

    /// Checks the structural invariants of §3.4 that are local to this node (callers are
    /// responsible for the global uniqueness invariant, which needs the whole path).
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        match self {
            Node::Branch(b) => {
                if b.non_empty_count() < 2 {
                    return Err("branch with fewer than 2 non-empty children");
                }
            }
            Node::Extension(e) => {
                if e.prefix.is_empty() {
                    return Err("extension with empty prefix");
                }
            }
            Node::Account(_) | Node::Value(_) => {}
        }
        Ok(())
    }
}
