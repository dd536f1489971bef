//! In-memory backend

use super::backend::{Backend, CasOutcome};
use crate::model::Hash;
use crate::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Backend holding everything in process memory
///
/// Useful for tests and for ephemeral trees that never touch disk.
#[derive(Default)]
pub struct MemoryBackend {
    blobs: RwLock<HashMap<Hash, Vec<u8>>>,
    meta: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(hash).cloned())
    }

    fn put(&self, hash: &Hash, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .entry(*hash)
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    fn delete(&self, hash: &Hash) -> Result<bool> {
        Ok(self.blobs.write().remove(hash).is_some())
    }

    fn exists(&self, hash: &Hash) -> Result<bool> {
        Ok(self.blobs.read().contains_key(hash))
    }

    fn digests(&self) -> Result<Vec<Hash>> {
        Ok(self.blobs.read().keys().copied().collect())
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.meta.read().get(key).cloned())
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        self.meta.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete_meta(&self, key: &str) -> Result<bool> {
        Ok(self.meta.write().remove(key).is_some())
    }

    fn compare_and_swap_meta(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<CasOutcome> {
        let mut meta = self.meta.write();
        let current = meta.get(key);
        if current.map(Vec::as_slice) != expected {
            return Ok(CasOutcome::Conflict(current.cloned()));
        }
        match new {
            Some(value) => meta.insert(key.to_string(), value.to_vec()),
            None => meta.remove(key),
        };
        Ok(CasOutcome::Swapped)
    }

    fn meta_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .meta
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_operations() {
        let backend = MemoryBackend::new();
        let h = Hash::digest(b"k");
        backend.put(&h, b"v1").unwrap();
        // first write wins; content addressing means a second put is the same blob
        backend.put(&h, b"v2").unwrap();
        assert_eq!(backend.get(&h).unwrap(), Some(b"v1".to_vec()));
        assert!(backend.exists(&h).unwrap());
        assert_eq!(backend.digests().unwrap(), vec![h]);
        assert!(backend.delete(&h).unwrap());
        assert!(!backend.delete(&h).unwrap());
        assert!(backend.is_empty());
    }

    #[test]
    fn test_compare_and_swap() {
        let backend = MemoryBackend::new();
        assert_eq!(
            backend.compare_and_swap_meta("ref/main", None, Some(b"a")).unwrap(),
            CasOutcome::Swapped
        );
        assert_eq!(
            backend.compare_and_swap_meta("ref/main", None, Some(b"b")).unwrap(),
            CasOutcome::Conflict(Some(b"a".to_vec()))
        );
        assert_eq!(
            backend
                .compare_and_swap_meta("ref/main", Some(b"a"), Some(b"b"))
                .unwrap(),
            CasOutcome::Swapped
        );
        assert_eq!(
            backend.compare_and_swap_meta("ref/main", Some(b"b"), None).unwrap(),
            CasOutcome::Swapped
        );
        assert_eq!(backend.get_meta("ref/main").unwrap(), None);
    }

    #[test]
    fn test_meta_keys_by_prefix() {
        let backend = MemoryBackend::new();
        backend.put_meta("ref/b", b"1").unwrap();
        backend.put_meta("ref/a", b"2").unwrap();
        backend.put_meta("prune/mark", b"3").unwrap();
        assert_eq!(backend.meta_keys("ref/").unwrap(), vec!["ref/a", "ref/b"]);
    }
}
