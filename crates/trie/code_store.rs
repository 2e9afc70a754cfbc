//! §4.11: a trivial append-only content-addressed store for contract bytecode. Unlike the
//! trie itself, code is immutable and never collides in a way that matters: two accounts
//! with the same code hash share the same bytes, so `put` is idempotent and there is
//! nothing here that needs a freelist, a cache, or node-style indirection.
//!
//! On-disk format (`codes.json`, despite the name a flat binary log, not JSON — §6.1):
//! a sequence of `[32-byte hash][4-byte big-endian length][code bytes]` records.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, StateError};
use crate::types::Hash;

const FILE_NAME: &str = "codes.json";
const HEADER_WIDTH: u64 = 32 + 4;

struct Entry {
    offset: u64,
    len: u32,
}

pub struct CodeStore {
    path: PathBuf,
    file: File,
    index: Mutex<HashMap<Hash, Entry>>,
}

impl CodeStore {
    #[tracing::instrument(level = "info", fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(FILE_NAME);
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let index = build_index(&file, &path)?;
        Ok(Self {
            path,
            file,
            index: Mutex::new(index),
        })
    }

    /// Stores `code` under its own Keccak hash. A no-op if that hash is already present:
    /// content-addressing means any two callers storing the same bytes agree on the record.
    #[tracing::instrument(level = "debug", skip(self, code))]
    pub fn put(&self, hash: Hash, code: &[u8]) -> Result<()> {
        if self.index.lock()?.contains_key(&hash) {
            return Ok(());
        }
        let offset = self.file.metadata()?.len();
        let mut record = Vec::with_capacity(HEADER_WIDTH as usize + code.len());
        record.extend_from_slice(hash.as_bytes());
        record.extend_from_slice(&(code.len() as u32).to_be_bytes());
        record.extend_from_slice(code);
        self.file.write_at(&record, offset)?;

        self.index.lock()?.insert(
            hash,
            Entry {
                offset: offset + HEADER_WIDTH,
                len: code.len() as u32,
            },
        );
        Ok(())
    }

    pub fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        let (offset, len) = match self.index.lock()?.get(hash) {
            Some(entry) => (entry.offset, entry.len),
            None => return Ok(None),
        };
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(Some(buf))
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool> {
        Ok(self.index.lock()?.contains_key(hash))
    }

    pub fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn build_index(file: &File, path: &Path) -> Result<HashMap<Hash, Entry>> {
    let len = file.metadata()?.len();
    let mut index = HashMap::new();
    let mut offset = 0u64;
    while offset < len {
        if offset + HEADER_WIDTH > len {
            return Err(StateError::CorruptionDetected(format!(
                "{:?} is truncated: {} trailing bytes short of a full header",
                path,
                len - offset
            )));
        }
        let mut header = [0u8; HEADER_WIDTH as usize];
        file.read_exact_at(&mut header, offset)?;
        let hash = Hash::from_slice(&header[0..32]);
        let record_len = u32::from_be_bytes(header[32..36].try_into().unwrap());
        let data_offset = offset + HEADER_WIDTH;
        if data_offset + record_len as u64 > len {
            return Err(StateError::CorruptionDetected(format!(
                "{:?} record at offset {} claims {} bytes past end of file",
                path, offset, record_len
            )));
        }
        index.insert(
            hash,
            Entry {
                offset: data_offset,
                len: record_len,
            },
        );
        offset = data_offset + record_len as u64;
    }
    Ok(index)
}
