//! Pluggable raw storage underneath the node store

use crate::model::Hash;
use crate::Result;

/// Outcome of [`Backend::compare_and_swap_meta`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// The key held something else; carries what was actually there
    Conflict(Option<Vec<u8>>),
}

/// Raw blob storage keyed by digest, plus a small mutable meta table
///
/// Blobs are opaque here: the node store computes digests and hands over the
/// stored form. Implementations must make each `put`, `delete` and meta write
/// individually atomic, and `put` durable before it returns when the backend
/// is configured for durability. The meta table holds branch pointers and
/// pruner bookkeeping; `compare_and_swap_meta` must be atomic with respect to
/// every other meta write.
pub trait Backend: Send + Sync {
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>>;

    /// Store `data` under `hash`. Storing an existing digest is a no-op.
    fn put(&self, hash: &Hash, data: &[u8]) -> Result<()>;

    /// Remove a blob, returning whether it existed
    fn delete(&self, hash: &Hash) -> Result<bool>;

    fn exists(&self, hash: &Hash) -> Result<bool> {
        Ok(self.get(hash)?.is_some())
    }

    /// Every stored digest, in no particular order
    fn digests(&self) -> Result<Vec<Hash>>;

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put_meta(&self, key: &str, value: &[u8]) -> Result<()>;

    fn delete_meta(&self, key: &str) -> Result<bool>;

    /// Replace the value at `key` only if it currently equals `expected`
    /// (`None` meaning absent). `new == None` deletes the key.
    fn compare_and_swap_meta(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<CasOutcome>;

    /// Meta keys starting with `prefix`, sorted
    fn meta_keys(&self, prefix: &str) -> Result<Vec<String>>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
