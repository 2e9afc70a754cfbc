//! A persistent, verifiable account-and-storage state engine: a hexary Merkle Patricia
//! Trie over account and storage-slot records, backed by fixed-width on-disk stocks with
//! an in-memory LRU cache and an async write-back buffer.
//!
//! [`LiveTrie`] is the single-version mutable entry point for a node building one chain of
//! state. [`ArchiveTrie`] layers an append-only block→root history on top via
//! copy-on-write. [`Verifier`] checks a tree's structure, reference accounting and
//! (optionally) its hashes without mutating anything. [`CodeStore`] is the companion
//! content-addressed store for contract bytecode.

mod archive_trie;
mod cache;
mod code_store;
mod codec;
mod config;
mod dirlock;
mod error;
mod forest;
mod hasher;
mod live_trie;
mod nibble;
mod node;
mod node_id;
mod stock;
mod types;
mod update;
mod verifier;
mod write_buffer;

pub use archive_trie::ArchiveTrie;
pub use code_store::CodeStore;
pub use config::{Configuration, HashStorageLocation, PersistedConfiguration, StorageMode};
pub use error::{MultiError, Result, StateError};
pub use hasher::HashHints;
pub use live_trie::LiveTrie;
pub use node_id::{NodeId, NodeKind};
pub use types::{empty_trie_hash, keccak256, AccountInfo, Address, Balance, Hash, Key, Nonce, Value};
pub use update::{apply_update, ApplyUpdate, Update};
pub use verifier::{NullObserver, Observer, VerificationReport, Verifier};
