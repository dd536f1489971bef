//! Merkle inclusion and exclusion proofs
//!
//! A proof is the chain of nodes from a root down to where a key's path
//! ends. Interior nodes are carried with every child except the one on the
//! path reduced to its digest; the last node is carried in full. Verifying
//! re-encodes each node with [`crate::codec`] and checks that the digests
//! chain up to the expected root, so a verifier needs no store.

mod verify;

pub use verify::verify;

use crate::config::KeyOrdering;
use crate::model::Hash;
use crate::store::NodeStore;
use crate::trie::{Entry, TrieNode};
use crate::{Error, Result, FORMAT_VERSION};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One branch node passed through on the way down
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub prefix: Vec<u8>,
    pub entry: Option<Entry>,
    /// Path byte of the child the walk descended into
    pub branch: u8,
    /// Every other child, ascending by byte
    pub siblings: Vec<(u8, Hash)>,
}

/// Where the walk stopped
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminal {
    /// The tree is empty
    Empty,
    Leaf { suffix: Vec<u8>, entry: Entry },
    /// A branch the key ends at, diverges from, or has no child for
    Branch {
        prefix: Vec<u8>,
        entry: Option<Entry>,
        children: BTreeMap<u8, Hash>,
    },
}

impl Terminal {
    fn to_node(&self) -> Option<TrieNode> {
        match self {
            Terminal::Empty => None,
            Terminal::Leaf { suffix, entry } => Some(TrieNode::leaf(suffix.clone(), entry.clone())),
            Terminal::Branch {
                prefix,
                entry,
                children,
            } => Some(TrieNode::Branch {
                prefix: prefix.clone(),
                entry: entry.clone(),
                children: children.clone(),
            }),
        }
    }
}

/// Evidence that a key has (or lacks) a value under some root
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub version: u32,
    pub ordering: KeyOrdering,
    pub key: Vec<u8>,
    pub steps: Vec<ProofStep>,
    pub terminal: Terminal,
}

fn wire() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

impl Proof {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(wire().serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let proof: Proof = wire().deserialize(bytes)?;
        if proof.version != FORMAT_VERSION {
            return Err(Error::VersionMismatch {
                expected: FORMAT_VERSION,
                found: proof.version,
            });
        }
        Ok(proof)
    }

    /// Whether this proof claims the key is present
    pub fn is_inclusion(&self) -> bool {
        matches!(verify::locate(self), Some(Some(_)))
    }

    /// The entry this proof shows for its key, if any
    pub fn entry(&self) -> Option<&Entry> {
        verify::locate(self).flatten()
    }
}

/// Build a proof for `key` under `root`
///
/// Absent keys produce an exclusion proof; only store failures are errors.
pub fn prove(store: &NodeStore, ordering: KeyOrdering, root: Hash, key: &[u8]) -> Result<Proof> {
    let path = ordering.path(key);
    let mut remaining: &[u8] = &path;
    let mut steps = Vec::new();
    let mut hash = root;

    let terminal = loop {
        if hash.is_zero() {
            break Terminal::Empty;
        }
        let (node_ordering, node) = store.load_node(&hash)?;
        if node_ordering != ordering {
            return Err(Error::CorruptState(format!(
                "Node {} was written with {:?} ordering, proof requested {:?}",
                hash, node_ordering, ordering
            )));
        }

        match node.as_ref() {
            TrieNode::Leaf { suffix, entry } => {
                break Terminal::Leaf {
                    suffix: suffix.clone(),
                    entry: entry.clone(),
                };
            }
            TrieNode::Branch {
                prefix,
                entry,
                children,
            } => {
                let next = remaining
                    .strip_prefix(prefix.as_slice())
                    .and_then(|after| after.split_first())
                    .and_then(|(byte, rest)| children.get(byte).map(|child| (*byte, *child, rest)));

                let Some((byte, child, rest)) = next else {
                    break Terminal::Branch {
                        prefix: prefix.clone(),
                        entry: entry.clone(),
                        children: children.clone(),
                    };
                };

                steps.push(ProofStep {
                    prefix: prefix.clone(),
                    entry: entry.clone(),
                    branch: byte,
                    siblings: children
                        .iter()
                        .filter(|(b, _)| **b != byte)
                        .map(|(b, h)| (*b, *h))
                        .collect(),
                });
                hash = child;
                remaining = rest;
            }
        }
    };

    Ok(Proof {
        version: FORMAT_VERSION,
        ordering,
        key: key.to_vec(),
        steps,
        terminal,
    })
}
