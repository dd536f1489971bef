//! Content-addressed blob store over a pluggable backend

use super::backend::Backend;
use super::blob::{stored_type, Blob, BlobType};
use super::memory::MemoryBackend;
use crate::codec;
use crate::config::{Config, KeyOrdering};
use crate::model::{Commit, Hash};
use crate::trie::TrieNode;
use crate::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

type CachedNode = (KeyOrdering, Arc<TrieNode>);

/// Stores immutable blobs by the digest of their content
///
/// Digests are always computed here from the canonical bytes; callers never
/// choose the address of what they store. Decoded nodes are kept in an LRU
/// cache, which is safe because a digest names exactly one node forever.
pub struct NodeStore {
    backend: Arc<dyn Backend>,
    compression_level: i32,
    cache: Option<Mutex<LruCache<Hash, CachedNode>>>,
}

impl NodeStore {
    pub fn new(backend: Arc<dyn Backend>, config: &Config) -> Self {
        NodeStore {
            backend,
            compression_level: config.compression_level,
            cache: NonZeroUsize::new(config.cache_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// A store over a fresh [`MemoryBackend`]
    pub fn in_memory(config: &Config) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Store a blob, returns its digest
    pub fn put(&self, blob: &Blob) -> Result<Hash> {
        let hash = blob.hash();
        if !self.backend.exists(&hash)? {
            self.backend.put(&hash, &blob.compress(self.compression_level)?)?;
        }
        Ok(hash)
    }

    /// Retrieve a blob, `None` if nothing is stored under `hash`
    pub fn get(&self, hash: &Hash) -> Result<Option<Blob>> {
        match self.backend.get(hash)? {
            Some(stored) => Ok(Some(Blob::decompress(&stored)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool> {
        self.backend.exists(hash)
    }

    /// Type of a stored blob without decoding it
    pub fn blob_type(&self, hash: &Hash) -> Result<Option<BlobType>> {
        match self.backend.get(hash)? {
            Some(stored) => Ok(Some(stored_type(&stored)?)),
            None => Ok(None),
        }
    }

    /// Remove one blob. Only the pruner should call this.
    pub fn delete(&self, hash: &Hash) -> Result<bool> {
        if let Some(cache) = &self.cache {
            cache.lock().pop(hash);
        }
        self.backend.delete(hash)
    }

    pub fn digests(&self) -> Result<Vec<Hash>> {
        self.backend.digests()
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }

    pub fn put_node(&self, ordering: KeyOrdering, node: &TrieNode) -> Result<Hash> {
        self.put(&codec::node_blob(ordering, node)?)
    }

    /// Load a node that live data refers to; absence is corruption
    pub fn load_node(&self, hash: &Hash) -> Result<CachedNode> {
        if let Some(cache) = &self.cache {
            if let Some((ordering, node)) = cache.lock().get(hash) {
                return Ok((*ordering, Arc::clone(node)));
            }
        }

        let blob = self.get(hash)?.ok_or_else(|| Error::missing(hash))?;
        if blob.blob_type != BlobType::Node {
            return Err(Error::CorruptState(format!(
                "Expected Node at {}, got {:?}",
                hash, blob.blob_type
            )));
        }
        let (ordering, node) = codec::decode_node(&blob.data)?;
        let node = Arc::new(node);

        if let Some(cache) = &self.cache {
            cache.lock().put(*hash, (ordering, Arc::clone(&node)));
        }
        Ok((ordering, node))
    }

    pub fn put_value(&self, value: &[u8]) -> Result<Hash> {
        self.put(&codec::value_blob(value))
    }

    /// Load a value blob referenced by a leaf; absence is corruption
    pub fn load_value(&self, hash: &Hash) -> Result<Vec<u8>> {
        let blob = self.get(hash)?.ok_or_else(|| Error::missing(hash))?;
        if blob.blob_type != BlobType::Value {
            return Err(Error::CorruptState(format!(
                "Expected Value at {}, got {:?}",
                hash, blob.blob_type
            )));
        }
        Ok(blob.data)
    }

    pub fn put_commit(&self, commit: &Commit) -> Result<Hash> {
        self.put(&codec::commit_blob(commit)?)
    }

    /// Retrieve a commit, `None` if the id is unknown
    pub fn get_commit(&self, hash: &Hash) -> Result<Option<Commit>> {
        let Some(blob) = self.get(hash)? else {
            return Ok(None);
        };
        if blob.blob_type != BlobType::Commit {
            return Err(Error::CorruptState(format!(
                "Expected Commit at {}, got {:?}",
                hash, blob.blob_type
            )));
        }
        Ok(Some(codec::decode_commit(&blob.data)?))
    }
}
