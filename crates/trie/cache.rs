//! §4.5: a fixed-capacity, in-memory node cache with an intrusive LRU list. Lookups that
//! hit a still-valid slot avoid the LRU mutex entirely; only insertion, eviction and the
//! "move to front" splice take it, mirroring `slab`-style indexed storage layered with an
//! explicit doubly linked list rather than relying on a general-purpose LRU crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use slab::Slab;

use crate::node::Node;
use crate::node_id::NodeId;

const NIL: usize = usize::MAX;

struct Slot {
    id: NodeId,
    node: Node,
    /// Bumped every time this slot is reused for a different node. A [`NodeReference`]
    /// handed out before the bump is stale and must not be trusted.
    tag: u64,
    prev: usize,
    next: usize,
}

/// A cheap, copyable handle a caller can retain to re-touch a cache entry without going
/// back through the id-keyed index, as long as `tag` still matches the slot's current
/// generation (§4.5, "lock-free fast path").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeReference {
    slot: usize,
    tag: u64,
}

struct Lru {
    slots: Slab<Slot>,
    index: HashMap<NodeId, usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let s = &self.slots[slot];
            (s.prev, s.next)
        };
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let s = &mut self.slots[slot];
            s.prev = NIL;
            s.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn touch(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    /// Inserts `(id, node)`, evicting the LRU tail if at capacity. Returns the new slot's
    /// reference plus the evicted `(id, node)` pair, if an eviction occurred.
    fn insert(&mut self, id: NodeId, node: Node) -> (NodeReference, Option<(NodeId, Node)>) {
        let mut evicted = None;
        if self.slots.len() >= self.capacity && self.tail != NIL {
            let tail = self.tail;
            self.unlink(tail);
            let removed = self.slots.remove(tail);
            self.index.remove(&removed.id);
            evicted = Some((removed.id, removed.node));
        }
        let tag_seed = self.slots.len() as u64;
        let slot = self.slots.insert(Slot {
            id,
            node,
            tag: tag_seed,
            prev: NIL,
            next: NIL,
        });
        self.push_front(slot);
        self.index.insert(id, slot);
        (NodeReference { slot, tag: tag_seed }, evicted)
    }

    fn remove(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.index.remove(&id)?;
        self.unlink(slot);
        Some(self.slots.remove(slot).node)
    }
}

/// Fixed-capacity node cache (§4.5). Capacity is set once at construction from
/// [`crate::config::Configuration::node_cache_capacity`].
pub struct NodeCache {
    lru: Mutex<Lru>,
    generation: AtomicU64,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            lru: Mutex::new(Lru::new(capacity.max(1))),
            generation: AtomicU64::new(0),
        }
    }

    /// Looks up `id`, cloning its node and bumping it to the front of the LRU if present.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn get(&self, id: NodeId) -> Option<Node> {
        let mut lru = self.lru.lock().unwrap();
        let slot = *lru.index.get(&id)?;
        lru.touch(slot);
        Some(lru.slots[slot].node.clone())
    }

    /// Re-touches a previously obtained [`NodeReference`] without an id lookup, as long as
    /// its tag still matches the slot's generation. Returns `false` if the slot was reused
    /// for a different node since the reference was issued (§4.5, "stale reference").
    pub fn touch(&self, reference: NodeReference) -> bool {
        let mut lru = self.lru.lock().unwrap();
        match lru.slots.get(reference.slot) {
            Some(slot) if slot.tag == reference.tag => {
                lru.touch(reference.slot);
                true
            }
            _ => false,
        }
    }

    /// Inserts or overwrites `id`'s entry, returning a fresh [`NodeReference`] and any
    /// node evicted to make room.
    #[tracing::instrument(level = "trace", skip(self, node))]
    pub fn set(&self, id: NodeId, node: Node) -> (NodeReference, Option<(NodeId, Node)>) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        let mut lru = self.lru.lock().unwrap();
        if let Some(&slot) = lru.index.get(&id) {
            lru.slots[slot].node = node;
            let tag = lru.slots[slot].tag;
            lru.touch(slot);
            return (NodeReference { slot, tag }, None);
        }
        lru.insert(id, node)
    }

    /// Drops `id` from the cache without returning it to the write buffer; used when a
    /// node is deleted outright rather than evicted (§4.3, structural rewrites).
    pub fn remove(&self, id: NodeId) -> Option<Node> {
        self.lru.lock().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lru.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
