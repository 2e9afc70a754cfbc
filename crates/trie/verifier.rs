//! §4.10: a stateless, read-only pass over an already-open [`Forest`] that checks a root's
//! structure, its reference accounting against the underlying stocks, and (optionally) its
//! hash. "Stateless" here means the verifier carries nothing of its own between calls other
//! than the immutable [`Forest`] reference it is given — repeated `verify` calls are
//! independent and safe to run concurrently with each other.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, StateError};
use crate::forest::Forest;
use crate::node::Node;
use crate::node_id::{NodeId, NodeKind};
use crate::types::Hash;

/// Progress callback for long verification runs. The default no-op implementation is
/// appropriate for tests and small tries; a CLI driving a full-archive verification can
/// implement this to drive a progress bar.
pub trait Observer {
    fn on_phase(&mut self, _phase: &str) {}
    fn on_node(&mut self, _id: NodeId) {}
}

/// An [`Observer`] that does nothing.
pub struct NullObserver;

impl Observer for NullObserver {}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    /// Distinct live nodes visited while walking from the root.
    pub nodes_visited: u64,
    /// Stock-allocated ids that the walk from the root never reached. Not necessarily a
    /// corruption by itself (e.g. a concurrent writer mid-archive-append can leave one
    /// behind transiently), but worth surfacing.
    pub orphaned_ids: Vec<NodeId>,
}

pub struct Verifier<'a> {
    forest: &'a Forest,
}

impl<'a> Verifier<'a> {
    pub fn new(forest: &'a Forest) -> Self {
        Self { forest }
    }

    /// Runs all three phases of §4.10 against `root`. `expected_hash`, when given, is
    /// compared against a freshly recomputed root hash (phase 3); omit it to skip hashing
    /// entirely and only check structure and reference accounting.
    pub fn verify(&self, root: NodeId, expected_hash: Option<Hash>, observer: &mut impl Observer) -> Result<VerificationReport> {
        observer.on_phase("structure");
        let mut reachable: HashMap<NodeKind, HashSet<u64>> = HashMap::new();
        self.walk(root, &mut reachable, observer)?;

        observer.on_phase("references");
        let mut orphaned_ids = Vec::new();
        for kind in NodeKind::stocked() {
            let stored = self.forest.stock_ids(kind)?;
            let empty = HashSet::new();
            let reached = reachable.get(&kind).unwrap_or(&empty);
            orphaned_ids.extend(stored.difference(reached).map(|&index| NodeId::new(kind, index)));
            for index in reached {
                if !stored.contains(index) {
                    return Err(StateError::InvariantViolation(format!(
                        "{:?} node at index {} is reachable but missing from its stock",
                        kind, index
                    )));
                }
            }
        }

        observer.on_phase("hashes");
        if let Some(expected) = expected_hash {
            let (actual, _) = self.forest.update_hashes(root)?;
            if actual != expected {
                return Err(StateError::InvariantViolation(format!(
                    "root hash mismatch: expected {:?}, computed {:?}",
                    expected, actual
                )));
            }
        }

        let nodes_visited = reachable.values().map(|ids| ids.len() as u64).sum();
        Ok(VerificationReport { nodes_visited, orphaned_ids })
    }

    fn walk(&self, id: NodeId, reachable: &mut HashMap<NodeKind, HashSet<u64>>, observer: &mut impl Observer) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        // Copy-on-write archives share untouched subtrees across many roots; a node already
        // recorded as reachable needs no repeat descent.
        if !reachable.entry(id.kind()).or_default().insert(id.index()) {
            return Ok(());
        }
        observer.on_node(id);

        let node = self.forest.load_node(id)?;
        node.check_invariants().map_err(|msg| StateError::InvariantViolation(msg.to_string()))?;
        match &node {
            Node::Branch(branch) => {
                for child in &branch.children {
                    self.walk(child.id, reachable, observer)?;
                }
            }
            Node::Extension(ext) => {
                if matches!(self.forest.load_node(ext.child.id)?, Node::Extension(_)) {
                    return Err(StateError::InvariantViolation("extension directly above an extension".into()));
                }
                self.walk(ext.child.id, reachable, observer)?;
            }
            Node::Account(account) => {
                self.walk(account.storage_root.id, reachable, observer)?;
            }
            Node::Value(_) => {}
        }
        Ok(())
    }
}
