//! Store-free proof verification

use super::{Proof, Terminal};
use crate::codec;
use crate::config::KeyOrdering;
use crate::model::Hash;
use crate::trie::{Entry, TrieNode, ValueRef};
use crate::FORMAT_VERSION;

/// Check `proof` against a trusted `root`
///
/// `expected` is the value the caller believes `key` has, or `None` to
/// check that `key` is absent. Returns `false` for any malformed, mismatched
/// or inconsistent proof; never panics on hostile input.
pub fn verify(proof: &Proof, root: Hash, key: &[u8], expected: Option<&[u8]>) -> bool {
    if proof.version != FORMAT_VERSION || proof.key != key {
        return false;
    }
    let Some(found) = locate(proof) else {
        return false;
    };

    let value_ok = match (found, expected) {
        (None, None) => true,
        (Some(entry), Some(value)) => value_matches(&entry.value, value),
        _ => false,
    };

    value_ok && recompute_root(proof) == Some(root)
}

/// Follow the key's path through the proof
///
/// `None` if the proof is not a well-formed walk for its key; otherwise the
/// entry found for the key (`Some(None)` means the proof shows absence).
pub(super) fn locate(proof: &Proof) -> Option<Option<&Entry>> {
    let path = proof.ordering.path(&proof.key);
    let mut remaining: &[u8] = &path;

    for step in &proof.steps {
        let (byte, rest) = remaining.strip_prefix(step.prefix.as_slice())?.split_first()?;
        if *byte != step.branch || !strictly_ascending(&step.siblings) {
            return None;
        }
        if step.siblings.iter().any(|(b, _)| *b == step.branch) {
            return None;
        }
        remaining = rest;
    }

    let found = match &proof.terminal {
        Terminal::Empty => {
            if !proof.steps.is_empty() {
                return None;
            }
            None
        }
        Terminal::Leaf { suffix, entry } => (suffix.as_slice() == remaining).then_some(entry),
        Terminal::Branch {
            prefix,
            entry,
            children,
        } => match remaining.strip_prefix(prefix.as_slice()) {
            None => None,
            Some(after) => match after.split_first() {
                None => entry.as_ref(),
                // the walk should have continued into this child
                Some((byte, _)) if children.contains_key(byte) => return None,
                Some(_) => None,
            },
        },
    };

    if let Some(entry) = found {
        let key_ok = match proof.ordering {
            KeyOrdering::Lexicographic => entry.key.is_none(),
            KeyOrdering::Hashed => entry.key.as_deref() == Some(proof.key.as_slice()),
        };
        if !key_ok {
            return None;
        }
    }
    Some(found)
}

fn recompute_root(proof: &Proof) -> Option<Hash> {
    let mut current = match proof.terminal.to_node() {
        None => Hash::ZERO,
        Some(node) => {
            if !node.is_canonical() {
                return None;
            }
            codec::node_digest(proof.ordering, &node).ok()?
        }
    };

    for step in proof.steps.iter().rev() {
        let mut children: std::collections::BTreeMap<u8, Hash> =
            step.siblings.iter().copied().collect();
        children.insert(step.branch, current);
        let node = TrieNode::Branch {
            prefix: step.prefix.clone(),
            entry: step.entry.clone(),
            children,
        };
        if !node.is_canonical() {
            return None;
        }
        current = codec::node_digest(proof.ordering, &node).ok()?;
    }
    Some(current)
}

fn value_matches(stored: &ValueRef, expected: &[u8]) -> bool {
    match stored {
        ValueRef::Inline(bytes) => bytes.as_slice() == expected,
        ValueRef::Stored(hash) => *hash == codec::value_digest(expected),
    }
}

fn strictly_ascending(siblings: &[(u8, Hash)]) -> bool {
    siblings.windows(2).all(|pair| pair[0].0 < pair[1].0)
}
