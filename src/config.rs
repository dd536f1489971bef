//! Engine configuration
//!
//! Stored as JSON, by default in ~/.config/rhizome/config.json.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How keys are laid out in the trie
///
/// Lexicographic keeps keys in byte order (prefix and range scans prune whole
/// subtrees). Hashed routes each key by its BLAKE3 digest, which gives uniform
/// fan-out regardless of key distribution. The choice is bound into every
/// node's encoding, so the same key set has different roots under each.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOrdering {
    #[default]
    Lexicographic,
    Hashed,
}

impl KeyOrdering {
    pub fn as_byte(&self) -> u8 {
        match self {
            KeyOrdering::Lexicographic => 0,
            KeyOrdering::Hashed => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(KeyOrdering::Lexicographic),
            1 => Some(KeyOrdering::Hashed),
            _ => None,
        }
    }

    /// The trie path a key is stored under
    pub fn path(&self, key: &[u8]) -> Vec<u8> {
        match self {
            KeyOrdering::Lexicographic => key.to_vec(),
            KeyOrdering::Hashed => crate::Hash::digest(key).as_bytes().to_vec(),
        }
    }
}

impl std::str::FromStr for KeyOrdering {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lexicographic" | "lex" => Ok(KeyOrdering::Lexicographic),
            "hashed" | "hash" => Ok(KeyOrdering::Hashed),
            other => Err(Error::Config(format!("unknown key ordering: {}", other))),
        }
    }
}

/// Tunables for a database
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ordering: KeyOrdering,

    /// Values up to this many bytes live inside the leaf; larger ones become
    /// separate value blobs referenced by digest
    pub inline_threshold: usize,

    /// Number of decoded nodes kept in the store's LRU cache (0 disables it)
    pub cache_capacity: usize,

    /// zstd level for blobs at rest
    pub compression_level: i32,

    /// fsync every record before `put` returns
    pub sync_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ordering: KeyOrdering::Lexicographic,
            inline_threshold: 32,
            cache_capacity: 4096,
            compression_level: 3,
            sync_writes: true,
        }
    }
}

impl Config {
    /// Default location: `<config dir>/rhizome/config.json`
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".into()))?;
        Ok(dir.join("rhizome").join("config.json"))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn with_ordering(mut self, ordering: KeyOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::Config(format!(
                "compression_level must be 1..=22, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}
