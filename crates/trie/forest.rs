//! §4.7: the DAG manager that owns every live node for one directory. Tries hold only
//! [`NodeId`]s; all actual node content, caching, hashing and persistence flows through here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::cache::NodeCache;
use crate::codec::Codec;
use crate::config::{Configuration, StorageMode};
use crate::dirlock::DirLock;
use crate::error::{Result, StateError};
use crate::hasher::{ChildRef, HashHints, Hasher};
use crate::nibble::Nibbles;
use crate::node::{AccountNode, BranchNode, ChildSlot, ExtensionNode, Node, ValueNode};
use crate::node_id::{NodeId, NodeKind};
use crate::stock::Stock;
use crate::types::{empty_trie_hash, keccak256, AccountInfo, Address, Hash, Key, Value};
use crate::write_buffer::{Persister, WriteBuffer};

struct Stocks {
    branches: Stock,
    extensions: Stock,
    accounts: Stock,
    values: Stock,
}

impl Stocks {
    fn open(dir: &Path, codec: &Codec) -> Result<Self> {
        Ok(Self {
            branches: Stock::open(dir.join("branches"), codec.width(NodeKind::Branch))?,
            extensions: Stock::open(dir.join("extensions"), codec.width(NodeKind::Extension))?,
            accounts: Stock::open(dir.join("accounts"), codec.width(NodeKind::Account))?,
            values: Stock::open(dir.join("values"), codec.width(NodeKind::Value))?,
        })
    }

    fn get(&self, kind: NodeKind) -> &Stock {
        match kind {
            NodeKind::Branch => &self.branches,
            NodeKind::Extension => &self.extensions,
            NodeKind::Account => &self.accounts,
            NodeKind::Value => &self.values,
            NodeKind::Empty => unreachable!("Empty has no backing stock"),
        }
    }

    fn flush(&self) -> Result<()> {
        let results = vec![
            self.branches.flush(),
            self.extensions.flush(),
            self.accounts.flush(),
            self.values.flush(),
        ];
        crate::error::MultiError::from_results(results)
            .map(|_| ())
            .map_err(|e| StateError::CorruptionDetected(e.to_string()))
    }
}

struct StockPersister {
    stocks: Arc<Stocks>,
    codec: Codec,
    in_flight: Arc<Mutex<HashMap<NodeId, Node>>>,
    own_hashes: Arc<Mutex<HashMap<NodeId, Hash>>>,
}

impl Persister for StockPersister {
    fn persist(&self, id: NodeId, node: &Node) -> Result<()> {
        let own_hash = self.own_hashes.lock()?.get(&id).copied();
        let bytes = self.codec.encode(node, own_hash);
        self.stocks.get(id.kind()).set(id.index(), &bytes)?;
        self.in_flight.lock()?.remove(&id);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ForestMeta {
    #[serde(rename = "Configuration")]
    configuration: String,
    #[serde(rename = "Mutable")]
    mutable: bool,
}

/// A small FIFO-eviction cache of address/key → Keccak hashes (§6.2 `HashCacheCapacity`).
/// Unlike `NodeCache` this does not need LRU precision: it only exists to avoid rehashing
/// the same address repeatedly within one block.
struct HashCache {
    map: HashMap<Vec<u8>, Hash>,
    order: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl HashCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get_or_insert(&mut self, key: &[u8]) -> Hash {
        if let Some(hash) = self.map.get(key) {
            return *hash;
        }
        let hash = keccak256(key);
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.map.insert(key.to_vec(), hash);
        self.order.push_back(key.to_vec());
        hash
    }
}

/// The DAG manager of §4.7. Not `Clone`: a directory has exactly one live `Forest`, guarded
/// by [`DirLock`].
pub struct Forest {
    dir: PathBuf,
    config: Configuration,
    codec: Codec,
    stocks: Arc<Stocks>,
    cache: NodeCache,
    write_buffer: WriteBuffer,
    dirty: Mutex<HashSet<NodeId>>,
    in_flight: Arc<Mutex<HashMap<NodeId, Node>>>,
    own_hashes: Arc<Mutex<HashMap<NodeId, Hash>>>,
    hasher: Hasher,
    hash_cache: Mutex<HashCache>,
    lock: Option<DirLock>,
}

impl Forest {
    #[tracing::instrument(level = "info", skip(config), fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, config: Configuration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let (lock, pre_existing) = DirLock::acquire(&dir)?;
        if pre_existing {
            tracing::warn!(dir = %dir.display(), "found a stale ~dirty marker; directory did not close cleanly last time");
        }

        let meta_path = dir.join("forest.json");
        if meta_path.exists() {
            let raw = fs::read_to_string(&meta_path)?;
            let persisted: ForestMeta = serde_json::from_str(&raw).map_err(|source| StateError::Json {
                file: "forest.json",
                source,
            })?;
            let expected = config.persisted();
            if persisted.configuration != expected.configuration || persisted.mutable != expected.mutable {
                return Err(StateError::ModeMismatch {
                    expected: format!("{}/{}", expected.configuration, expected.mutable),
                    found: format!("{}/{}", persisted.configuration, persisted.mutable),
                });
            }
        } else {
            let persisted = config.persisted();
            let meta = ForestMeta {
                configuration: persisted.configuration,
                mutable: persisted.mutable,
            };
            let json = serde_json::to_string(&meta).map_err(|source| StateError::Json {
                file: "forest.json",
                source,
            })?;
            fs::write(&meta_path, json)?;
        }

        let codec = Codec::from_config(&config);
        let stocks = Arc::new(Stocks::open(&dir, &codec)?);
        let in_flight = Arc::new(Mutex::new(HashMap::new()));
        let own_hashes = Arc::new(Mutex::new(HashMap::new()));

        let persister = StockPersister {
            stocks: Arc::clone(&stocks),
            codec,
            in_flight: Arc::clone(&in_flight),
            own_hashes: Arc::clone(&own_hashes),
        };
        let write_buffer = WriteBuffer::spawn(config.write_buffer_capacity, persister);
        let cache = NodeCache::new(config.node_cache_capacity);
        let hash_cache = Mutex::new(HashCache::new(config.hash_cache_capacity));

        Ok(Self {
            dir,
            codec,
            stocks,
            cache,
            write_buffer,
            dirty: Mutex::new(HashSet::new()),
            in_flight,
            own_hashes,
            hasher: Hasher,
            hash_cache,
            lock: Some(lock),
            config,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    fn is_mutable(&self) -> bool {
        matches!(self.config.storage_mode, StorageMode::Mutable)
    }

    fn hash_address(&self, address: &Address) -> Hash {
        self.hash_cache.lock().unwrap().get_or_insert(address.as_bytes())
    }

    fn hash_key(&self, key: &Key) -> Hash {
        self.hash_cache.lock().unwrap().get_or_insert(key.as_bytes())
    }

    // --- node store primitives -------------------------------------------------------

    /// Exposed to [`crate::verifier::Verifier`], which needs raw node content without going
    /// through any of the account/value-shaped convenience methods above.
    pub(crate) fn load_node(&self, id: NodeId) -> Result<Node> {
        self.load(id)
    }

    /// All indices the given kind's stock currently has allocated, independent of whether
    /// they're reachable from any root — the other half of the verifier's reference check.
    pub(crate) fn stock_ids(&self, kind: NodeKind) -> Result<std::collections::HashSet<u64>> {
        self.stocks.get(kind).ids()
    }

    fn load(&self, id: NodeId) -> Result<Node> {
        if let Some(node) = self.cache.get(id) {
            return Ok(node);
        }
        // Reinstatement race (§10): a node evicted-while-dirty may still be sitting in the
        // write buffer's queue rather than on disk. Check, and cancel the in-flight write
        // atomically with pulling it back into the cache, before ever touching the Stock.
        {
            let mut in_flight = self.in_flight.lock()?;
            if let Some(node) = in_flight.remove(&id) {
                self.write_buffer.cancel(id);
                self.install(id, node.clone(), true)?;
                return Ok(node);
            }
        }
        let bytes = self.stocks.get(id.kind()).get(id.index())?;
        let (node, own_hash) = self.codec.decode(id.kind(), &bytes)?;
        if let Some(hash) = own_hash {
            self.own_hashes.lock()?.insert(id, hash);
        }
        self.install(id, node.clone(), false)?;
        Ok(node)
    }

    /// Installs `node` under `id` in the cache, forwarding any dirty node the insertion
    /// evicts to the write buffer.
    fn install(&self, id: NodeId, node: Node, dirty: bool) -> Result<()> {
        let (_, evicted) = self.cache.set(id, node);
        if let Some((evicted_id, evicted_node)) = evicted {
            if self.dirty.lock()?.remove(&evicted_id) {
                self.in_flight.lock()?.insert(evicted_id, evicted_node.clone());
                self.write_buffer.add(evicted_id, evicted_node)?;
            }
        }
        let mut dirty_set = self.dirty.lock()?;
        if dirty {
            dirty_set.insert(id);
        } else {
            dirty_set.remove(&id);
        }
        Ok(())
    }

    fn allocate(&self, kind: NodeKind, node: Node) -> Result<NodeId> {
        let index = self.stocks.get(kind).new_index()?;
        let id = NodeId::new(kind, index);
        self.install(id, node, true)?;
        Ok(id)
    }

    /// Overwrites `id` in mutable mode; allocates a fresh id for the mutated content in
    /// archive mode, leaving the frozen original untouched (§3.4, "archive immutability").
    fn overwrite_or_clone(&self, id: NodeId, new_node: Node) -> Result<NodeId> {
        if self.is_mutable() {
            self.install(id, new_node, true)?;
            Ok(id)
        } else {
            self.allocate(id.kind(), new_node)
        }
    }

    fn release(&self, id: NodeId) -> Result<()> {
        if !self.is_mutable() {
            return Ok(()); // archive mode never releases nodes (§3.5)
        }
        self.cache.remove(id);
        self.write_buffer.cancel(id);
        self.in_flight.lock()?.remove(&id);
        self.dirty.lock()?.remove(&id);
        self.own_hashes.lock()?.remove(&id);
        self.stocks.get(id.kind()).delete(id.index())?;
        Ok(())
    }

    // --- account / value recursive descent --------------------------------------------

    fn find_leaf(&self, root: NodeId, path: &Nibbles) -> Result<Option<NodeId>> {
        let mut current = root;
        let mut offset = 0usize;
        loop {
            if current.is_empty() {
                return Ok(None);
            }
            match self.load(current)? {
                Node::Branch(b) => {
                    let nibble = path.at(offset);
                    current = b.children[nibble as usize].id;
                    offset += 1;
                }
                Node::Extension(e) => {
                    let remaining = path.offset(offset);
                    if e.prefix.count_prefix(&remaining) != e.prefix.len() {
                        return Ok(None);
                    }
                    offset += e.prefix.len();
                    current = e.child.id;
                }
                leaf @ (Node::Account(_) | Node::Value(_)) => {
                    // Reaching a leaf before consuming all of `path` doesn't mean it's the
                    // leaf being searched for: two keys sharing a branch/extension prefix can
                    // still diverge beyond it (§4.3 "split"). Only a full match on the leaf's
                    // own hashed path confirms identity; anything else is a miss.
                    return Ok(if self.leaf_full_path(&leaf) == *path {
                        Some(current)
                    } else {
                        None
                    });
                }
            }
        }
    }

    pub fn get_account(&self, root: NodeId, address: &Address) -> Result<Option<AccountInfo>> {
        let path = Nibbles::from_hash(self.hash_address(address).as_bytes());
        match self.find_leaf(root, &path)? {
            Some(id) => match self.load(id)? {
                Node::Account(a) => Ok(Some(a.info)),
                _ => Err(StateError::InvariantViolation("account path led to a non-account leaf".into())),
            },
            None => Ok(None),
        }
    }

    /// The root of an account's independent storage subtree, or `NodeId::EMPTY` if the
    /// account doesn't exist or has no storage yet. Callers needing to apply a slot write
    /// (which operates on a bare storage-root id, §4.7) read this first.
    pub fn get_account_storage_root(&self, root: NodeId, address: &Address) -> Result<NodeId> {
        let path = Nibbles::from_hash(self.hash_address(address).as_bytes());
        match self.find_leaf(root, &path)? {
            Some(id) => match self.load(id)? {
                Node::Account(a) => Ok(a.storage_root.id),
                _ => Err(StateError::InvariantViolation("account path led to a non-account leaf".into())),
            },
            None => Ok(NodeId::EMPTY),
        }
    }

    /// Rewrites an account's `storage_root` field in place, leaving `info` untouched. Used
    /// to thread a new storage root back onto its owning account after a slot write.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_account_storage_root(&self, root: NodeId, address: &Address, storage_root: NodeId) -> Result<NodeId> {
        let path = Nibbles::from_hash(self.hash_address(address).as_bytes());
        if self.find_leaf(root, &path)?.is_none() {
            return Err(StateError::InvariantViolation(
                "set_account_storage_root called on an address with no account".into(),
            ));
        }
        self.insert(
            root,
            &path,
            0,
            &|_| unreachable!("already checked the account exists"),
            &|existing| match existing {
                Node::Account(a) => {
                    let updated = AccountNode {
                        storage_root: ChildSlot::new(storage_root),
                        ..a.clone()
                    };
                    (Node::Account(updated), updated_is_empty(&updated))
                }
                _ => unreachable!("find_leaf only returns Account ids along an account path"),
            },
        )
    }

    pub fn get_value(&self, storage_root: NodeId, key: &Key) -> Result<Option<Value>> {
        let path = Nibbles::from_hash(self.hash_key(key).as_bytes());
        match self.find_leaf(storage_root, &path)? {
            Some(id) => match self.load(id)? {
                Node::Value(v) => Ok(Some(v.value)),
                _ => Err(StateError::InvariantViolation("storage path led to a non-value leaf".into())),
            },
            None => Ok(None),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_account(&self, root: NodeId, address: &Address, info: AccountInfo) -> Result<NodeId> {
        let path = Nibbles::from_hash(self.hash_address(address).as_bytes());
        let address = *address;
        self.insert(
            root,
            &path,
            0,
            &|suffix_len| {
                Node::Account(AccountNode {
                    suffix_len,
                    address,
                    info,
                    storage_root: ChildSlot::empty(),
                })
            },
            &|existing| match existing {
                Node::Account(a) => {
                    let updated = AccountNode { info, ..a.clone() };
                    (Node::Account(updated), info.is_empty())
                }
                _ => unreachable!("find_leaf only returns Account ids along an account path"),
            },
        )
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_value(&self, storage_root: NodeId, key: &Key, value: Value) -> Result<NodeId> {
        let path = Nibbles::from_hash(self.hash_key(key).as_bytes());
        let key = *key;
        self.insert(
            storage_root,
            &path,
            0,
            &|suffix_len| Node::Value(ValueNode { suffix_len, key, value }),
            &|existing| match existing {
                Node::Value(v) => {
                    let updated = ValueNode { value, ..v.clone() };
                    (Node::Value(updated), value == Value::zero())
                }
                _ => unreachable!("find_leaf only returns Value ids along a storage path"),
            },
        )
    }

    /// Resets an account's storage root to Empty, releasing its old storage subtree is left
    /// to the caller (a full subtree walk is out of scope for this primitive; archive mode
    /// keeps the old subtree reachable from history anyway).
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn clear_storage(&self, root: NodeId, address: &Address) -> Result<NodeId> {
        let path = Nibbles::from_hash(self.hash_address(address).as_bytes());
        match self.find_leaf(root, &path)? {
            None => Ok(root),
            Some(_) => self.insert(
                root,
                &path,
                0,
                &|_| unreachable!("clear_storage never inserts a fresh account"),
                &|existing| match existing {
                    Node::Account(a) => {
                        let updated = AccountNode {
                            storage_root: ChildSlot::empty(),
                            ..a.clone()
                        };
                        (Node::Account(updated), updated_is_empty(&updated))
                    }
                    _ => unreachable!("find_leaf only returns Account ids along an account path"),
                },
            ),
        }
    }

    /// The shared recursive descent of §4.3: navigates `path` from `current`, creating,
    /// updating or removing the leaf it lands on, rewriting every ancestor on the way back
    /// up (cloning them first in archive mode).
    fn insert(
        &self,
        current: NodeId,
        path: &Nibbles,
        offset: usize,
        make_leaf: &dyn Fn(u8) -> Node,
        overwrite_leaf: &dyn Fn(&Node) -> (Node, bool),
    ) -> Result<NodeId> {
        if current.is_empty() {
            let suffix_len = (path.len() - offset) as u8;
            let leaf = make_leaf(suffix_len);
            return self.allocate(leaf.kind(), leaf);
        }

        let node = self.load(current)?;
        match node {
            Node::Branch(mut branch) => {
                let nibble = path.at(offset) as usize;
                let child = branch.children[nibble].id;
                let new_child = self.insert(child, path, offset + 1, make_leaf, overwrite_leaf)?;
                branch.children[nibble] = ChildSlot::new(new_child);

                if new_child.is_empty() {
                    if let Some((slot, single)) = branch.single_child() {
                        let nibble_into_leaf = slot as u8;
                        let prefix = Nibbles::from_hex(vec![nibble_into_leaf]);
                        return self.collapse_branch(current, prefix, single.id);
                    }
                }
                self.overwrite_or_clone(current, Node::Branch(branch))
            }
            Node::Extension(ext) => {
                let remaining = path.offset(offset);
                let common = ext.prefix.count_prefix(&remaining);
                if common == ext.prefix.len() {
                    let new_child = self.insert(ext.child.id, path, offset + ext.prefix.len(), make_leaf, overwrite_leaf)?;
                    if new_child.is_empty() {
                        self.release(current)?;
                        return Ok(NodeId::EMPTY);
                    }
                    let new_ext = ExtensionNode {
                        prefix: ext.prefix.clone(),
                        child: ChildSlot::new(new_child),
                    };
                    return self.merge_or_store_extension(current, new_ext);
                }
                // divergence inside the extension: split it.
                self.split_extension(current, &ext, &remaining, common, offset, path, make_leaf, overwrite_leaf)
            }
            leaf @ (Node::Account(_) | Node::Value(_)) => {
                let leaf_suffix = self.leaf_full_path(&leaf).offset(offset);
                let new_suffix = path.offset(offset);
                let common = leaf_suffix.count_prefix(&new_suffix);
                if common == leaf_suffix.len() {
                    let (new_leaf, should_delete) = overwrite_leaf(&leaf);
                    if should_delete {
                        self.release(current)?;
                        Ok(NodeId::EMPTY)
                    } else {
                        self.overwrite_or_clone(current, new_leaf)
                    }
                } else {
                    self.split_leaf(current, &leaf_suffix, &new_suffix, common, offset, path, make_leaf, overwrite_leaf)
                }
            }
        }
    }

    /// A branch whose recursion just emptied out down to a single child collapses into
    /// that child, but the nibble the branch used to select it must still be accounted for
    /// somewhere, or path offsets computed further up (by `find_leaf`, `encode_node`) go
    /// stale by one nibble. An Extension child absorbs it by prepending to its own prefix
    /// (keeping the no-degenerate-extensions invariant, §3.4); anything else — a Branch or
    /// a leaf — is wrapped in a fresh 1-nibble Extension. Extension-over-leaf is not
    /// prohibited by §3.4, only Extension-over-Extension is.
    fn collapse_branch(&self, branch_id: NodeId, prefix: Nibbles, child_id: NodeId) -> Result<NodeId> {
        self.release(branch_id)?;
        if child_id.is_empty() {
            return Ok(NodeId::EMPTY);
        }
        let child = self.load(child_id)?;
        match child {
            Node::Extension(mut e) => {
                let mut merged = prefix;
                merged.extend(&e.prefix);
                e.prefix = merged;
                self.overwrite_or_clone(child_id, Node::Extension(e))
            }
            Node::Account(_) | Node::Value(_) | Node::Branch(_) => {
                let ext = ExtensionNode {
                    prefix,
                    child: ChildSlot::new(child_id),
                };
                self.allocate(NodeKind::Extension, Node::Extension(ext))
            }
        }
    }

    fn merge_or_store_extension(&self, id: NodeId, ext: ExtensionNode) -> Result<NodeId> {
        let child = self.load(ext.child.id)?;
        if let Node::Extension(mut child_ext) = child {
            let mut merged = ext.prefix.clone();
            merged.extend(&child_ext.prefix);
            child_ext.prefix = merged;
            self.release(ext.child.id)?;
            return self.overwrite_or_clone(id, Node::Extension(child_ext));
        }
        self.overwrite_or_clone(id, Node::Extension(ext))
    }

    /// The full 64-nibble hashed path a leaf actually sits at, independent of how it was
    /// reached. Used to detect, at the point recursion lands on an existing leaf, whether
    /// the path being inserted names that same leaf or a different one sharing only a prefix.
    fn leaf_full_path(&self, leaf: &Node) -> Nibbles {
        match leaf {
            Node::Account(a) => Nibbles::from_hash(self.hash_address(&a.address).as_bytes()),
            Node::Value(v) => Nibbles::from_hash(self.hash_key(&v.key).as_bytes()),
            _ => unreachable!("leaf_full_path is only called on Account/Value nodes"),
        }
    }

    /// Inserting a path that diverges from an existing leaf's own path partway through
    /// pushes that leaf down behind a fresh branch (and, if the shared prefix is non-empty,
    /// an extension), mirroring `split_extension` but forking on a leaf instead of an
    /// extension. The existing leaf's id and content are untouched, only its parent changes,
    /// so this needs no `release`/clone even in archive mode: it is simply referenced from
    /// a new position.
    #[allow(clippy::too_many_arguments)]
    fn split_leaf(
        &self,
        existing_id: NodeId,
        leaf_suffix: &Nibbles,
        new_suffix: &Nibbles,
        common: usize,
        offset: usize,
        path: &Nibbles,
        make_leaf: &dyn Fn(u8) -> Node,
        overwrite_leaf: &dyn Fn(&Node) -> (Node, bool),
    ) -> Result<NodeId> {
        let mut branch = BranchNode::empty();
        branch.children[leaf_suffix.at(common) as usize] = ChildSlot::new(existing_id);

        let new_leaf_id = self.insert(NodeId::EMPTY, path, offset + common + 1, make_leaf, overwrite_leaf)?;
        branch.children[new_suffix.at(common) as usize] = ChildSlot::new(new_leaf_id);

        let branch_id = self.allocate(NodeKind::Branch, Node::Branch(branch))?;

        if common == 0 {
            Ok(branch_id)
        } else {
            let ext = ExtensionNode {
                prefix: new_suffix.slice(0, common),
                child: ChildSlot::new(branch_id),
            };
            self.allocate(NodeKind::Extension, Node::Extension(ext))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_extension(
        &self,
        id: NodeId,
        ext: &ExtensionNode,
        remaining: &Nibbles,
        common: usize,
        offset: usize,
        path: &Nibbles,
        make_leaf: &dyn Fn(u8) -> Node,
        overwrite_leaf: &dyn Fn(&Node) -> (Node, bool),
    ) -> Result<NodeId> {
        let ext_next_nibble = ext.prefix.at(common);
        let mut branch = BranchNode::empty();

        if ext.prefix.len() - common == 1 {
            branch.children[ext_next_nibble as usize] = ext.child.clone();
        } else {
            let tail = ExtensionNode {
                prefix: ext.prefix.slice(common + 1, ext.prefix.len()),
                child: ext.child.clone(),
            };
            let tail_id = self.allocate(NodeKind::Extension, Node::Extension(tail))?;
            branch.children[ext_next_nibble as usize] = ChildSlot::new(tail_id);
        }

        if common < remaining.len() {
            let branch_nibble = remaining.at(common) as usize;
            let new_leaf_id = self.insert(NodeId::EMPTY, path, offset + common + 1, make_leaf, overwrite_leaf)?;
            branch.children[branch_nibble] = ChildSlot::new(new_leaf_id);
        }

        self.release(id)?;
        let branch_id = self.allocate(NodeKind::Branch, Node::Branch(branch))?;

        if common == 0 {
            Ok(branch_id)
        } else {
            let new_ext = ExtensionNode {
                prefix: remaining.slice(0, common),
                child: ChildSlot::new(branch_id),
            };
            self.allocate(NodeKind::Extension, Node::Extension(new_ext))
        }
    }

    // --- hashing -------------------------------------------------------------------

    /// Bottom-up hashing pass of §4.4/§4.7: recomputes the hash (and embedding decision) of
    /// every node reachable from `root` whose cached hash is stale, returning the root hash
    /// and a hint map any sibling root can reuse instead of re-traversing shared subtrees.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn update_hashes(&self, root: NodeId) -> Result<(Hash, HashHints)> {
        let mut hints = HashHints::new();
        let (_, hash) = self.encode_node(root, 0, &mut hints)?;
        Ok((hash, hints))
    }

    /// `offset` is the number of nibbles already consumed getting from the root to `id`;
    /// it is threaded down through the recursion rather than read back off the persisted
    /// `suffix_len` field, so hashing is correct regardless of whether the active
    /// configuration tracks suffix lengths (`suffix_len` remains a persisted convenience
    /// field for isolated-leaf rehashing, which this top-down pass does not need).
    fn encode_node(&self, id: NodeId, offset: usize, hints: &mut HashHints) -> Result<(Vec<u8>, Hash)> {
        if id.is_empty() {
            let encoded = self.hasher.encode_empty();
            return Ok((encoded.clone(), self.hasher.hash_of(&encoded)));
        }
        let node = self.load(id)?;
        let (encoded, hash) = match node {
            Node::Branch(mut branch) => {
                let mut dirty = false;
                let mut refs: [ChildRef; 16] = std::array::from_fn(|_| ChildRef::Empty);
                for i in 0..16 {
                    refs[i] = self.child_ref(&mut branch.children[i], offset + 1, hints, &mut dirty)?;
                }
                let encoded = self.hasher.encode_branch(&refs);
                if dirty {
                    self.install(id, Node::Branch(branch), true)?;
                }
                (encoded.clone(), self.hasher.hash_of(&encoded))
            }
            Node::Extension(mut ext) => {
                let mut dirty = false;
                let child_offset = offset + ext.prefix.len();
                let child_ref = self.child_ref(&mut ext.child, child_offset, hints, &mut dirty)?;
                let encoded = self.hasher.encode_extension(&ext.prefix, &child_ref);
                if dirty {
                    self.install(id, Node::Extension(ext), true)?;
                }
                (encoded.clone(), self.hasher.hash_of(&encoded))
            }
            Node::Account(mut account) => {
                let mut dirty = false;
                // the account's own nibble path never branches further below it: its
                // storage subtree starts its own, independent 64-nibble key space at offset 0.
                let storage_ref = self.storage_root_ref(&mut account.storage_root, hints, &mut dirty)?;
                let full_path = Nibbles::from_hash(keccak256(account.address.as_bytes()).as_bytes());
                let suffix = full_path.offset(offset);
                let encoded = self.hasher.encode_account_leaf(&suffix, &account.info, &storage_ref);
                if dirty {
                    self.install(id, Node::Account(account), true)?;
                }
                (encoded.clone(), self.hasher.hash_of(&encoded))
            }
            Node::Value(value) => {
                let full_path = Nibbles::from_hash(keccak256(value.key.as_bytes()).as_bytes());
                let suffix = full_path.offset(offset);
                let encoded = self.hasher.encode_value_leaf(&suffix, &value.value);
                (encoded.clone(), self.hasher.hash_of(&encoded))
            }
        };
        hints.insert(id, hash);
        self.own_hashes.lock()?.insert(id, hash);
        Ok((encoded, hash))
    }

    /// Resolves an account's `storage_root` slot to a [`ChildRef`]. Unlike an ordinary
    /// child slot, a storage root is always a 32-byte hash reference in the mainstream
    /// Ethereum-compatible encoding: empty storage hashes to the canonical empty-trie hash
    /// rather than the RLP empty string, and a storage trie's root is never embedded in the
    /// account leaf even when its own encoding happens to be under 32 bytes.
    fn storage_root_ref(&self, slot: &mut ChildSlot, hints: &mut HashHints, parent_dirty: &mut bool) -> Result<ChildRef> {
        if slot.id.is_empty() {
            return Ok(ChildRef::Hash(empty_trie_hash()));
        }
        if let (Some(hash), false) = (slot.cached_hash, slot.embedded) {
            return Ok(ChildRef::Hash(hash));
        }
        let (_, hash) = self.encode_node(slot.id, 0, hints)?;
        slot.cached_hash = Some(hash);
        slot.embedded = false;
        *parent_dirty = true;
        Ok(ChildRef::Hash(hash))
    }

    /// Resolves one child slot to a [`ChildRef`], recursing only when the cached hash is
    /// stale or the child is small enough to need re-embedding (§4.4's dirty-propagation rule).
    fn child_ref(&self, slot: &mut ChildSlot, child_offset: usize, hints: &mut HashHints, parent_dirty: &mut bool) -> Result<ChildRef> {
        if slot.id.is_empty() {
            return Ok(ChildRef::Empty);
        }
        if let (Some(hash), false) = (slot.cached_hash, slot.embedded) {
            return Ok(ChildRef::Hash(hash));
        }
        let (encoded, hash) = self.encode_node(slot.id, child_offset, hints)?;
        let embedded = encoded.len() < 32;
        slot.cached_hash = Some(hash);
        slot.embedded = embedded;
        *parent_dirty = true;
        Ok(if embedded {
            ChildRef::Embedded(encoded)
        } else {
            ChildRef::Hash(hash)
        })
    }

    // --- lifecycle -------------------------------------------------------------------

    pub fn freeze(&self, _id: NodeId) {
        // Archive mode never overwrites existing ids in place (see `overwrite_or_clone`), so
        // every node already on disk under this forest is effectively frozen; there is no
        // separate flag to flip.
    }

    /// Runs the local structural invariants of §3.4 over every node reachable from `root`.
    pub fn check(&self, root: NodeId) -> Result<()> {
        if root.is_empty() {
            return Ok(());
        }
        let node = self.load(root)?;
        node.check_invariants().map_err(|msg| StateError::InvariantViolation(msg.to_string()))?;
        match &node {
            Node::Branch(b) => {
                for child in &b.children {
                    if !child.is_empty() {
                        self.check(child.id)?;
                    }
                }
            }
            Node::Extension(e) => {
                if matches!(self.load(e.child.id)?, Node::Extension(_)) {
                    return Err(StateError::InvariantViolation("extension directly above an extension".into()));
                }
                self.check(e.child.id)?;
            }
            Node::Account(a) => {
                if !a.storage_root.is_empty() {
                    self.check(a.storage_root.id)?;
                }
            }
            Node::Value(_) => {}
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn flush(&self) -> Result<()> {
        let still_dirty: Vec<NodeId> = self.dirty.lock()?.iter().copied().collect();
        for id in still_dirty {
            if let Some(node) = self.cache.get(id) {
                let own_hash = self.own_hashes.lock()?.get(&id).copied();
                let bytes = self.codec.encode(&node, own_hash);
                self.stocks.get(id.kind()).set(id.index(), &bytes)?;
                self.dirty.lock()?.remove(&id);
            }
        }
        self.write_buffer.flush()?;
        self.stocks.flush()?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.write_buffer.close()?;
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn updated_is_empty(account: &AccountNode) -> bool {
    account.info.is_empty()
}
