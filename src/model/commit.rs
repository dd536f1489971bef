//! Commit type - an immutable snapshot in the version graph

use super::Hash;
use serde::{Deserialize, Serialize};

/// A commit records one tree root and the commits it was derived from
///
/// Commits form a DAG. The identifier of a commit is the digest of its
/// canonical encoding, so identical histories produce identical identifiers
/// on every peer. For the same reason the timestamp is a logical clock, not
/// wall time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Root digest of the tree snapshot (`Hash::ZERO` for the empty tree)
    pub root: Hash,

    /// Parent commit ids, in the order the caller supplied them
    pub parents: Vec<Hash>,

    /// Logical timestamp: 0 for genesis, otherwise one past the newest parent
    pub timestamp: u64,

    pub author: Option<String>,

    pub message: Option<String>,

    /// Opaque caller metadata
    pub metadata: Option<Vec<u8>>,
}

/// Optional descriptive fields attached to a new commit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitInfo {
    pub author: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<Vec<u8>>,
}

impl CommitInfo {
    pub fn message(message: impl Into<String>) -> Self {
        CommitInfo {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl Commit {
    pub fn new(root: Hash, parents: Vec<Hash>, timestamp: u64, info: CommitInfo) -> Self {
        Commit {
            root,
            parents,
            timestamp,
            author: info.author,
            message: info.message,
            metadata: info.metadata,
        }
    }

    /// Compute the commit identifier from its canonical encoding
    pub fn id(&self) -> crate::Result<Hash> {
        Ok(crate::codec::commit_blob(self)?.hash())
    }

    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}
