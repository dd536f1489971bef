//! Canonical encoding of everything that gets a digest
//!
//! Every node, value and commit is hashed over the bytes produced here, and
//! proof verification recomputes node digests with the very same
//! [`node_digest`]. Nothing else in the crate may serialize these types for
//! hashing.
//!
//! Layout (bincode, fixed-width little-endian integers):
//! ```text
//! node:   u32 format version | u8 key ordering | TrieNode
//! commit: u32 format version | Commit
//! value:  raw bytes
//! ```
//! The blob digest is `blake3(type tag || encoding)`, see [`Blob::hash`].

use crate::config::KeyOrdering;
use crate::model::{Commit, Hash};
use crate::store::{Blob, BlobType};
use crate::trie::TrieNode;
use crate::{Error, Result, FORMAT_VERSION};

/// Canonical bytes of a node
pub fn encode_node(ordering: KeyOrdering, node: &TrieNode) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(FORMAT_VERSION, ordering.as_byte(), node))?)
}

pub fn node_blob(ordering: KeyOrdering, node: &TrieNode) -> Result<Blob> {
    Ok(Blob::new(BlobType::Node, encode_node(ordering, node)?))
}

/// Digest a node would be stored under
pub fn node_digest(ordering: KeyOrdering, node: &TrieNode) -> Result<Hash> {
    Ok(node_blob(ordering, node)?.hash())
}

pub fn decode_node(data: &[u8]) -> Result<(KeyOrdering, TrieNode)> {
    check_version(data)?;
    let (_, ordering, node): (u32, u8, TrieNode) = bincode::deserialize(data)
        .map_err(|e| Error::CorruptState(format!("Undecodable node: {}", e)))?;
    let ordering = KeyOrdering::from_byte(ordering)
        .ok_or_else(|| Error::CorruptState(format!("Invalid key ordering tag: {}", ordering)))?;
    Ok((ordering, node))
}

pub fn value_blob(value: &[u8]) -> Blob {
    Blob::new(BlobType::Value, value.to_vec())
}

/// Digest a value blob with these bytes would be stored under
pub fn value_digest(value: &[u8]) -> Hash {
    Hash::digest_many(&[&[BlobType::Value.as_byte()], value])
}

pub fn commit_blob(commit: &Commit) -> Result<Blob> {
    let data = bincode::serialize(&(FORMAT_VERSION, commit))?;
    Ok(Blob::new(BlobType::Commit, data))
}

pub fn decode_commit(data: &[u8]) -> Result<Commit> {
    check_version(data)?;
    let (_, commit): (u32, Commit) = bincode::deserialize(data)
        .map_err(|e| Error::CorruptState(format!("Undecodable commit: {}", e)))?;
    Ok(commit)
}

fn check_version(data: &[u8]) -> Result<()> {
    let head: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::CorruptState("Truncated encoding".into()))?;
    let found = u32::from_le_bytes(head);
    if found != FORMAT_VERSION {
        return Err(Error::VersionMismatch {
            expected: FORMAT_VERSION,
            found,
        });
    }
    Ok(())
}
