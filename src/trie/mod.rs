//! Merkle trie with structural sharing between versions
//!
//! This implements a content-addressed radix trie where:
//! - Each node's digest is derived from its children's digests
//! - Unchanged subtrees share storage across versions
//! - The root digest uniquely identifies the entire key/value set

mod node;
mod tree;

pub use node::{Entry, TrieNode, ValueRef};
pub use tree::{Change, MerkleTrie};

pub(crate) use tree::walk;
