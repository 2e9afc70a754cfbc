//! §4.9: an append-only sequence of block → (root id, root hash) records over an
//! Immutable-mode [`Forest`]. Each [`ArchiveTrie::add`] call applies one block's [`Update`]
//! atop the previous root with copy-on-write, sharing every untouched subtree with the
//! prior root via the forest's existing ids, then freezes and records the result.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::config::Configuration;
use crate::error::{Result, StateError};
use crate::forest::Forest;
use crate::node_id::NodeId;
use crate::types::{empty_trie_hash, AccountInfo, Address, Hash, Key, Value};
use crate::update::{apply_update, ApplyUpdate, Update};

const ROOTS_FILE: &str = "roots.dat";
const RECORD_WIDTH: u64 = 40; // 8B node id + 32B hash

/// Append-only block→root log (§4.9). `roots.dat` record `N` holds the root for block `N`;
/// a query for a block past the last recorded one reads the last record instead ("blocks
/// with no recorded root inherit the most recent prior root").
pub struct ArchiveTrie {
    forest: Forest,
    file: File,
    /// Highest block number with a record, or `None` for a brand-new archive.
    height: Option<u64>,
    /// The most recently recorded (root id, root hash); the base `add` builds on next.
    tip: (NodeId, Hash),
}

impl ArchiveTrie {
    #[tracing::instrument(level = "info", skip(config), fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, config: Configuration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let forest = Forest::open(&dir, config)?;

        let path = dir.join(ROOTS_FILE);
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let len = file.metadata()?.len();
        if len % RECORD_WIDTH != 0 {
            return Err(StateError::CorruptionDetected(format!(
                "{:?} is {} bytes, not a multiple of the {}-byte record width",
                path, len, RECORD_WIDTH
            )));
        }

        let (height, tip) = if len == 0 {
            (None, (NodeId::EMPTY, empty_trie_hash()))
        } else {
            let last_index = len / RECORD_WIDTH - 1;
            let record = read_record(&file, last_index)?;
            (Some(last_index), record)
        };

        Ok(Self { forest, file, height, tip })
    }

    pub fn get_block_height(&self) -> Option<u64> {
        self.height
    }

    pub fn get_account(&self, block: u64, address: &Address) -> Result<Option<AccountInfo>> {
        let (root, _) = self.record_for(block)?;
        self.forest.get_account(root, address)
    }

    pub fn get_value(&self, block: u64, address: &Address, key: &Key) -> Result<Option<Value>> {
        let (root, _) = self.record_for(block)?;
        let storage_root = self.forest.get_account_storage_root(root, address)?;
        self.forest.get_value(storage_root, key)
    }

    /// Resolves `block`'s (root id, root hash) pair, clamping to the last recorded block if
    /// `block` is past the tip (§4.9, "inherit the most recent prior root").
    fn record_for(&self, block: u64) -> Result<(NodeId, Hash)> {
        let height = self
            .height
            .ok_or_else(|| StateError::InvariantViolation("archive has no recorded blocks yet".into()))?;
        read_record(&self.file, block.min(height))
    }

    /// Applies `update` atop the previous root, sharing untouched structure via copy-on-write,
    /// and appends one `roots.dat` record for `block`. An empty update is a short circuit:
    /// the previous root is repeated rather than re-walked (§10, "empty blocks").
    ///
    /// `precomputed_root_hash`, when the caller (typically a companion `LiveTrie` that just
    /// applied the identical logical update) already knows the resulting root hash, skips
    /// this trie's own re-hash pass — the root hash is pure content, so it transfers across
    /// forests even though the two tries allocate unrelated node ids for the same update.
    #[tracing::instrument(level = "info", skip(self, update, precomputed_root_hash))]
    pub fn add(&mut self, block: u64, update: &Update, precomputed_root_hash: Option<Hash>) -> Result<(NodeId, Hash)> {
        self.fill_gap_to(block)?;

        if update.is_empty() {
            self.append_record(self.tip)?;
            self.height = Some(block);
            return Ok(self.tip);
        }

        let mut cursor = ArchiveCursor {
            forest: &self.forest,
            root: self.tip.0,
        };
        apply_update(&mut cursor, update)?;
        let new_root = cursor.root;
        self.forest.freeze(new_root);

        let hash = match precomputed_root_hash {
            Some(hash) => hash,
            None => self.forest.update_hashes(new_root)?.0,
        };

        self.tip = (new_root, hash);
        self.append_record(self.tip)?;
        self.height = Some(block);
        Ok(self.tip)
    }

    /// Repeats the current tip for every block number strictly between the last recorded
    /// block and `block`, preserving the invariant that record index == block number.
    fn fill_gap_to(&mut self, block: u64) -> Result<()> {
        let next = self.height.map(|h| h + 1).unwrap_or(0);
        for _ in next..block {
            self.append_record(self.tip)?;
        }
        Ok(())
    }

    fn append_record(&self, (id, hash): (NodeId, Hash)) -> Result<()> {
        let index = self.file.metadata()?.len() / RECORD_WIDTH;
        let mut buf = [0u8; RECORD_WIDTH as usize];
        buf[0..8].copy_from_slice(&id.as_u64().to_le_bytes());
        buf[8..40].copy_from_slice(hash.as_bytes());
        self.file.write_at(&buf, index * RECORD_WIDTH)?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        self.forest.flush()
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn close(self) -> Result<()> {
        self.file.sync_data()?;
        self.forest.close()
    }

    pub fn dir(&self) -> &Path {
        self.forest.dir()
    }
}

fn read_record(file: &File, index: u64) -> Result<(NodeId, Hash)> {
    let mut buf = [0u8; RECORD_WIDTH as usize];
    file.read_exact_at(&mut buf, index * RECORD_WIDTH)?;
    let id = NodeId::from_u64(u64::from_le_bytes(buf[0..8].try_into().unwrap()));
    let hash = Hash::from_slice(&buf[8..40]);
    Ok((id, hash))
}

/// Local cursor threading a root through one `apply_update` call against an Immutable-mode
/// forest; mirrors [`crate::live_trie::LiveTrie`]'s primitives without persisting anything
/// itself — `ArchiveTrie::add` owns persistence of the resulting root.
struct ArchiveCursor<'a> {
    forest: &'a Forest,
    root: NodeId,
}

impl ArchiveCursor<'_> {
    fn get_account(&self, address: &Address) -> Result<Option<AccountInfo>> {
        self.forest.get_account(self.root, address)
    }
}

impl ApplyUpdate for ArchiveCursor<'_> {
    fn get_or_create_account(&mut self, address: Address) -> Result<AccountInfo> {
        Ok(self.get_account(&address)?.unwrap_or_default())
    }

    fn put_account(&mut self, address: Address, info: AccountInfo) -> Result<()> {
        self.root = self.forest.set_account(self.root, &address, info)?;
        Ok(())
    }

    fn clear_storage(&mut self, address: Address) -> Result<()> {
        self.root = self.forest.clear_storage(self.root, &address)?;
        Ok(())
    }

    fn put_slot(&mut self, address: Address, key: Key, value: Value) -> Result<()> {
        let storage_root = self.forest.get_account_storage_root(self.root, &address)?;
        let new_storage_root = self.forest.set_value(storage_root, &key, value)?;
        self.root = self.forest.set_account_storage_root(self.root, &address, new_storage_root)?;
        Ok(())
    }

    fn delete_account(&mut self, address: Address) -> Result<()> {
        self.root = self.forest.set_account(self.root, &address, AccountInfo::default())?;
        Ok(())
    }
}
