//! §4.1: a persistent, indexed container of homogeneous fixed-width byte records with a
//! LIFO freelist. One `Stock` backs each node-type directory (`accounts/`, `branches/`,
//! `extensions/`, `values/`) under the forest root (§6.1).
//!
//! `Stock` deals only in raw, fixed-width byte buffers; translating between a `Node`
//! variant and its buffer is the job of [`crate::codec`], which picks a width from the
//! active [`crate::config::Configuration`] (§4.2).

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

/// The set of indices currently allocated (not on the freelist) in a stock.
pub type IndexSet = HashSet<u64>;

#[derive(Debug, Serialize, Deserialize)]
struct StockMetaFile {
    #[serde(rename = "RecordWidth")]
    record_width: usize,
    #[serde(rename = "Size")]
    size: u64,
}

struct StockMeta {
    size: u64,
    freelist: Vec<u64>,
    dirty_meta: bool,
}

/// A persistent, indexed container of fixed-width byte records. See module docs.
pub struct Stock {
    dir: PathBuf,
    record_width: usize,
    values_file: File,
    meta: Mutex<StockMeta>,
}

impl Stock {
    /// Opens (creating if absent) a stock directory holding records of `record_width`
    /// bytes each. Fails with [`StateError::CorruptionDetected`] if an existing
    /// `meta.json` records a different width (schema mismatch, §4.1).
    pub fn open(dir: impl AsRef<Path>, record_width: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let meta_path = dir.join("meta.json");
        let values_path = dir.join("values.dat");
        let freelist_path = dir.join("freelist.dat");

        let values_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&values_path)?;

        let (size, freelist) = if meta_path.exists() {
            let raw = fs::read_to_string(&meta_path)?;
            let parsed: StockMetaFile = serde_json::from_str(&raw).map_err(|source| StateError::Json {
                file: "meta.json",
                source,
            })?;
            if parsed.record_width != record_width {
                return Err(StateError::CorruptionDetected(format!(
                    "stock at {:?} has record width {}, expected {}",
                    dir, parsed.record_width, record_width
                )));
            }
            let expected_len = parsed.size * record_width as u64;
            if values_file.metadata()?.len() < expected_len {
                return Err(StateError::CorruptionDetected(format!(
                    "stock at {:?}: values.dat shorter than meta.json declares", dir
                )));
            }
            let freelist = read_freelist(&freelist_path)?;
            if freelist.iter().any(|&i| i >= parsed.size) {
                return Err(StateError::CorruptionDetected(format!(
                    "stock at {:?}: freelist references an index beyond Size", dir
                )));
            }
            (parsed.size, freelist)
        } else {
            (0, Vec::new())
        };

        Ok(Self {
            dir,
            record_width,
            values_file,
            meta: Mutex::new(StockMeta {
                size,
                freelist,
                dirty_meta: true,
            }),
        })
    }

    pub fn record_width(&self) -> usize {
        self.record_width
    }

    /// Allocates a fresh index: recycled from the freelist in LIFO order if one exists,
    /// otherwise the array is extended by one zeroed record.
    pub fn new_index(&self) -> Result<u64> {
        let mut meta = self.meta.lock()?;
        if let Some(index) = meta.freelist.pop() {
            meta.dirty_meta = true;
            return Ok(index);
        }
        let index = meta.size;
        meta.size += 1;
        meta.dirty_meta = true;
        let offset = index * self.record_width as u64;
        self.values_file
            .write_at(&vec![0u8; self.record_width], offset)?;
        Ok(index)
    }

    pub fn get(&self, index: u64) -> Result<Vec<u8>> {
        self.check_bounds(index)?;
        let mut buf = vec![0u8; self.record_width];
        self.values_file
            .read_exact_at(&mut buf, index * self.record_width as u64)?;
        Ok(buf)
    }

    pub fn set(&self, index: u64, value: &[u8]) -> Result<()> {
        self.check_bounds(index)?;
        if value.len() != self.record_width {
            return Err(StateError::CorruptionDetected(format!(
                "record width mismatch: got {} expected {}",
                value.len(),
                self.record_width
            )));
        }
        self.values_file.write_at(value, index * self.record_width as u64)?;
        Ok(())
    }

    /// Releases `index` back to the freelist. The slot's bytes are not zeroed; a later
    /// `get` on a deleted index is a logic error in the caller, not in `Stock`.
    pub fn delete(&self, index: u64) -> Result<()> {
        self.check_bounds(index)?;
        let mut meta = self.meta.lock()?;
        meta.freelist.push(index);
        meta.dirty_meta = true;
        Ok(())
    }

    fn check_bounds(&self, index: u64) -> Result<()> {
        let meta = self.meta.lock()?;
        if index >= meta.size {
            return Err(StateError::CorruptionDetected(format!(
                "index {} out of range (size {})",
                index, meta.size
            )));
        }
        Ok(())
    }

    /// All indices currently allocated (i.e. `0..size` minus the freelist).
    pub fn ids(&self) -> Result<IndexSet> {
        let meta = self.meta.lock()?;
        let freed: IndexSet = meta.freelist.iter().copied().collect();
        Ok((0..meta.size).filter(|i| !freed.contains(i)).collect())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.meta.lock()?.size)
    }

    /// Persists the freelist and metadata, and fsyncs the values file.
    pub fn flush(&self) -> Result<()> {
        self.values_file.sync_data()?;
        let mut meta = self.meta.lock()?;
        if !meta.dirty_meta {
            return Ok(());
        }
        write_freelist(&self.dir.join("freelist.dat"), &meta.freelist)?;
        let meta_file = StockMetaFile {
            record_width: self.record_width,
            size: meta.size,
        };
        let json = serde_json::to_string(&meta_file).map_err(|source| StateError::Json {
            file: "meta.json",
            source,
        })?;
        fs::write(self.dir.join("meta.json"), json)?;
        meta.dirty_meta = false;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()
    }
}

fn read_freelist(path: &Path) -> Result<Vec<u64>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read(path)?;
    if raw.len() % 8 != 0 {
        return Err(StateError::CorruptionDetected(format!(
            "freelist.dat at {:?} is not a multiple of 8 bytes", path
        )));
    }
    Ok(raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn write_freelist(path: &Path, freelist: &[u64]) -> Result<()> {
    let mut buf = Vec::with_capacity(freelist.len() * 8);
    for &index in freelist {
        buf.write_all(&index.to_le_bytes())?;
    }
    fs::write(path, buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_get_set_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let stock = Stock::open(dir.path(), 4).unwrap();
        let i = stock.new_index().unwrap();
        stock.set(i, b"abcd").unwrap();
        assert_eq!(stock.get(i).unwrap(), b"abcd");
    }

    #[test]
    fn freelist_recycles_in_lifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let stock = Stock::open(dir.path(), 1).unwrap();
        let a = stock.new_index().unwrap();
        let b = stock.new_index().unwrap();
        stock.delete(a).unwrap();
        stock.delete(b).unwrap();
        assert_eq!(stock.new_index().unwrap(), b);
        assert_eq!(stock.new_index().unwrap(), a);
    }

    #[test]
    fn out_of_range_get_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let stock = Stock::open(dir.path(), 1).unwrap();
        assert!(stock.get(0).is_err());
    }

    #[test]
    fn reopen_after_flush_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stock = Stock::open(dir.path(), 2).unwrap();
            let i = stock.new_index().unwrap();
            stock.set(i, b"hi").unwrap();
            stock.flush().unwrap();
        }
        let stock = Stock::open(dir.path(), 2).unwrap();
        assert_eq!(stock.get(0).unwrap(), b"hi");
        assert_eq!(stock.ids().unwrap(), [0u64].into_iter().collect());
    }

    #[test]
    fn reopen_with_mismatched_width_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stock = Stock::open(dir.path(), 2).unwrap();
            stock.flush().unwrap();
        }
        assert!(Stock::open(dir.path(), 4).is_err());
    }
}
