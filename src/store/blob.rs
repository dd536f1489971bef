//! Blob type - the unit of content-addressed storage

use crate::model::Hash;
use serde::{Deserialize, Serialize};

/// Type tag for blobs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobType {
    /// A trie node
    Node,
    /// A value too large to inline in its leaf
    Value,
    /// A commit in the version graph
    Commit,
}

impl BlobType {
    pub fn as_byte(&self) -> u8 {
        match self {
            BlobType::Node => 0,
            BlobType::Value => 1,
            BlobType::Commit => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(BlobType::Node),
            1 => Some(BlobType::Value),
            2 => Some(BlobType::Commit),
            _ => None,
        }
    }
}

/// A typed chunk of canonical data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub blob_type: BlobType,
    /// Canonical (uncompressed) bytes
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(blob_type: BlobType, data: Vec<u8>) -> Self {
        Blob { blob_type, data }
    }

    /// Content digest; the type tag is hashed in so a value can never
    /// masquerade as a node with the same bytes
    pub fn hash(&self) -> Hash {
        Hash::digest_many(&[&[self.blob_type.as_byte()], &self.data])
    }

    /// Stored form: type byte followed by zstd-compressed data
    pub fn compress(&self, level: i32) -> crate::Result<Vec<u8>> {
        let mut output = Vec::with_capacity(self.data.len() / 2 + 1);
        output.push(self.blob_type.as_byte());
        output.extend(zstd::encode_all(self.data.as_slice(), level)?);
        Ok(output)
    }

    pub fn decompress(data: &[u8]) -> crate::Result<Self> {
        let (&tag, body) = data
            .split_first()
            .ok_or_else(|| crate::Error::CorruptState("Empty blob data".into()))?;
        let blob_type = peek_type(tag)?;
        let decompressed = zstd::decode_all(body)
            .map_err(|e| crate::Error::CorruptState(format!("Undecodable blob: {}", e)))?;

        Ok(Blob {
            blob_type,
            data: decompressed,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Read the type of a stored blob without decompressing it
pub fn stored_type(stored: &[u8]) -> crate::Result<BlobType> {
    let tag = stored
        .first()
        .ok_or_else(|| crate::Error::CorruptState("Empty blob data".into()))?;
    peek_type(*tag)
}

fn peek_type(tag: u8) -> crate::Result<BlobType> {
    BlobType::from_byte(tag)
        .ok_or_else(|| crate::Error::CorruptState(format!("Invalid blob type: {}", tag)))
}
