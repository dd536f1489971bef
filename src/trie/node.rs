//! Trie node types

use crate::model::Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a value lives: inside the leaf, or in its own value blob
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueRef {
    Inline(Vec<u8>),
    Stored(Hash),
}

/// A key/value pair as recorded in a node
///
/// `key` holds the original key only under hashed ordering, where the trie
/// path is the key's digest and the key itself would otherwise be lost.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub key: Option<Vec<u8>>,
    pub value: ValueRef,
}

/// A node in the merkle trie
///
/// A compressed radix trie over path bytes. The layout is canonical: the
/// empty tree has no node, a branch always has at least one child, and a
/// branch without an entry has at least two. Together these make the shape
/// (and therefore the root digest) a function of the key set alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrieNode {
    /// Terminal node holding the rest of a single key's path
    Leaf { suffix: Vec<u8>, entry: Entry },
    /// Interior node
    Branch {
        /// Path bytes shared by everything below
        prefix: Vec<u8>,
        /// Entry for the key whose path ends exactly here
        entry: Option<Entry>,
        /// Children indexed by the path byte following `prefix`
        children: BTreeMap<u8, Hash>,
    },
}

impl TrieNode {
    pub fn leaf(suffix: Vec<u8>, entry: Entry) -> Self {
        TrieNode::Leaf { suffix, entry }
    }

    /// The path bytes this node consumes before its own entry/children
    pub fn path(&self) -> &[u8] {
        match self {
            TrieNode::Leaf { suffix, .. } => suffix,
            TrieNode::Branch { prefix, .. } => prefix,
        }
    }

    /// Same node with `head` prepended to its path
    pub fn with_path_prefix(self, head: &[u8]) -> Self {
        let join = |rest: Vec<u8>| {
            let mut path = head.to_vec();
            path.extend(rest);
            path
        };
        match self {
            TrieNode::Leaf { suffix, entry } => TrieNode::Leaf {
                suffix: join(suffix),
                entry,
            },
            TrieNode::Branch {
                prefix,
                entry,
                children,
            } => TrieNode::Branch {
                prefix: join(prefix),
                entry,
                children,
            },
        }
    }

    pub fn entry(&self) -> Option<&Entry> {
        match self {
            TrieNode::Leaf { entry, .. } => Some(entry),
            TrieNode::Branch { entry, .. } => entry.as_ref(),
        }
    }

    /// Child digests, in path-byte order
    pub fn child_hashes(&self) -> Vec<Hash> {
        match self {
            TrieNode::Leaf { .. } => Vec::new(),
            TrieNode::Branch { children, .. } => children.values().copied().collect(),
        }
    }

    /// Check the canonical-layout rules for this node in isolation
    pub fn is_canonical(&self) -> bool {
        match self {
            TrieNode::Leaf { .. } => true,
            TrieNode::Branch {
                entry, children, ..
            } => match entry {
                Some(_) => !children.is_empty(),
                None => children.len() >= 2,
            },
        }
    }
}
