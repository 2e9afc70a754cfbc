//! §6.2: the enumerated configuration surface, persisted per-directory in `forest.json`
//! and compared against the caller's requested configuration on open (§4.7, §7 `ModeMismatch`).

use serde::{Deserialize, Serialize};

/// Where a node's hash (and its children's hashes) are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashStorageLocation {
    /// Child hashes live on the parent record (Branch/Extension/Account carry 32 extra
    /// bytes per child). Requires `track_suffix_lengths` so leaves can be rehashed without
    /// a further disk read. Used by the archive preset.
    WithParent,
    /// Each record carries its own hash plus a dirty bit. Used by the live preset.
    WithNode,
}

/// Whether a forest is a single mutable live trie or an append-only archive of frozen
/// historical roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    Mutable,
    Immutable,
}

/// Full configuration for a [`crate::forest::Forest`]. Opening a directory whose persisted
/// `forest.json` disagrees with the configuration requested by the caller is a fatal
/// [`crate::error::StateError::ModeMismatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub name: String,
    pub hash_storage_location: HashStorageLocation,
    pub track_suffix_lengths: bool,
    pub node_cache_capacity: usize,
    pub hash_cache_capacity: usize,
    pub write_buffer_capacity: usize,
    pub storage_mode: StorageMode,
}

/// What `forest.json` actually persists: everything else is a runtime tuning knob that
/// does not affect on-disk compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedConfiguration {
    #[serde(rename = "Configuration")]
    pub configuration: String,
    #[serde(rename = "Mutable")]
    pub mutable: bool,
}

impl Configuration {
    pub fn persisted(&self) -> PersistedConfiguration {
        PersistedConfiguration {
            configuration: self.name.clone(),
            mutable: matches!(self.storage_mode, StorageMode::Mutable),
        }
    }

    pub fn matches_persisted(&self, other: &PersistedConfiguration) -> bool {
        self.name == other.configuration
            && matches!(self.storage_mode, StorageMode::Mutable) == other.mutable
    }

    /// The live-trie preset: hash-with-node, no side hash table, single mutable root.
    pub fn live_with_node() -> Self {
        let mut cfg = Self::defaults("live-with-node", HashStorageLocation::WithNode, StorageMode::Mutable);
        cfg.track_suffix_lengths = false;
        cfg.apply_env_overrides();
        cfg
    }

    /// The archive preset: hash-with-parent (so sibling live/archive roots can share the
    /// precomputed-hint optimisation of §4.9), frozen nodes, unbounded history.
    pub fn archive_with_parent() -> Self {
        let mut cfg = Self::defaults(
            "archive-with-parent",
            HashStorageLocation::WithParent,
            StorageMode::Immutable,
        );
        cfg.track_suffix_lengths = true;
        cfg.apply_env_overrides();
        cfg
    }

    fn defaults(name: &str, hash_storage_location: HashStorageLocation, storage_mode: StorageMode) -> Self {
        Self {
            name: name.to_string(),
            hash_storage_location,
            track_suffix_lengths: false,
            node_cache_capacity: 10_000_000,
            hash_cache_capacity: 100_000,
            write_buffer_capacity: 1024,
            storage_mode,
        }
    }

    /// Environment-variable overrides for the capacity knobs, loaded the way
    /// `ethrex-config` loads node configuration: a typed struct deserialized with `envy`
    /// under a crate-specific prefix, falling back to the preset's defaults when unset.
    fn apply_env_overrides(&mut self) {
        if let Ok(overrides) = envy::prefixed("STATE_TRIE_").from_env::<EnvOverrides>() {
            if let Some(v) = overrides.node_cache_capacity {
                self.node_cache_capacity = v;
            }
            if let Some(v) = overrides.hash_cache_capacity {
                self.hash_cache_capacity = v;
            }
            if let Some(v) = overrides.write_buffer_capacity {
                self.write_buffer_capacity = v;
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    node_cache_capacity: Option<usize>,
    hash_cache_capacity: Option<usize>,
    write_buffer_capacity: Option<usize>,
}
