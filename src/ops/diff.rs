//! Diff operations between tree states

use crate::codec;
use crate::config::KeyOrdering;
use crate::model::Hash;
use crate::trie::{Entry, MerkleTrie, TrieNode, ValueRef};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Type of change in a diff
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiffEntry {
    /// Key was added
    Added { key: Vec<u8>, value: Vec<u8> },
    /// Key was removed
    Removed { key: Vec<u8>, value: Vec<u8> },
    /// Key was modified
    Modified {
        key: Vec<u8>,
        old_value: Vec<u8>,
        new_value: Vec<u8>,
    },
}

impl DiffEntry {
    pub fn key(&self) -> &[u8] {
        match self {
            DiffEntry::Added { key, .. } => key,
            DiffEntry::Removed { key, .. } => key,
            DiffEntry::Modified { key, .. } => key,
        }
    }
}

/// A diff between two tree states
#[derive(Clone, Debug, Default)]
pub struct Diff {
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    pub fn new(entries: Vec<DiffEntry>) -> Self {
        Diff { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn added_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, DiffEntry::Added { .. }))
            .count()
    }

    pub fn removed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, DiffEntry::Removed { .. }))
            .count()
    }

    pub fn modified_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, DiffEntry::Modified { .. }))
            .count()
    }
}

/// A position inside a node's compressed path: `offset` bytes of the
/// node's prefix/suffix have been consumed
#[derive(Clone, Copy, PartialEq, Eq)]
struct Cursor {
    hash: Hash,
    offset: usize,
}

/// Pending comparison: the two sides at the same trie path
struct Frame {
    old: Option<Cursor>,
    new: Option<Cursor>,
    path: Vec<u8>,
}

/// Compute the diff between two tree states
///
/// Both trees are walked in lockstep by path. Wherever the two sides point
/// at the same node digest the whole subtree is skipped, so the cost is
/// proportional to the changed part of the trees, not their size. The walk
/// keeps its own stack and consumes compressed paths whole, so long keys
/// cost no more depth than short ones.
pub fn diff_trees(trie: &MerkleTrie, old_root: Hash, new_root: Hash) -> Result<Diff> {
    if old_root == new_root {
        return Ok(Diff::default());
    }

    let cursor = |root: Hash| (!root.is_zero()).then_some(Cursor { hash: root, offset: 0 });
    let mut entries = Vec::new();
    let mut stack = vec![Frame {
        old: cursor(old_root),
        new: cursor(new_root),
        path: Vec::new(),
    }];
    while let Some(frame) = stack.pop() {
        diff_frame(trie, frame, &mut stack, &mut entries)?;
    }

    // Sort entries for determinism
    entries.sort_by(|a, b| a.key().cmp(b.key()));

    Ok(Diff::new(entries))
}

fn diff_frame(
    trie: &MerkleTrie,
    frame: Frame,
    stack: &mut Vec<Frame>,
    out: &mut Vec<DiffEntry>,
) -> Result<()> {
    let Frame {
        mut old,
        mut new,
        mut path,
    } = frame;
    match (old, new) {
        (None, None) => return Ok(()),
        (Some(o), Some(n)) if o == n => return Ok(()),
        _ => {}
    }

    let old_node = old.map(|c| trie.load(&c.hash)).transpose()?;
    let new_node = new.map(|c| trie.load(&c.hash)).transpose()?;

    // Skip the stretch of compressed path both sides agree on
    match (old.as_mut().zip(old_node.as_deref()), new.as_mut().zip(new_node.as_deref())) {
        (Some((o, old_node)), Some((n, new_node))) => {
            let old_rest = &old_node.path()[o.offset..];
            let new_rest = &new_node.path()[n.offset..];
            let common = old_rest
                .iter()
                .zip(new_rest)
                .take_while(|(a, b)| a == b)
                .count();
            path.extend_from_slice(&old_rest[..common]);
            o.offset += common;
            n.offset += common;
        }
        (Some((c, node)), None) | (None, Some((c, node))) => {
            path.extend_from_slice(&node.path()[c.offset..]);
            c.offset = node.path().len();
        }
        (None, None) => {}
    }

    let old_view = old.zip(old_node.as_deref());
    let new_view = new.zip(new_node.as_deref());

    let old_entry = old_view.and_then(|(c, node)| entry_at(c, node));
    let new_entry = new_view.and_then(|(c, node)| entry_at(c, node));

    match (old_entry, new_entry) {
        (None, None) => {}
        (None, Some(entry)) => out.push(DiffEntry::Added {
            key: key_of(trie, &path, entry)?,
            value: trie.resolve(&entry.value)?,
        }),
        (Some(entry), None) => out.push(DiffEntry::Removed {
            key: key_of(trie, &path, entry)?,
            value: trie.resolve(&entry.value)?,
        }),
        (Some(old_entry), Some(new_entry)) => {
            if !same_value(&old_entry.value, &new_entry.value) {
                out.push(DiffEntry::Modified {
                    key: key_of(trie, &path, new_entry)?,
                    old_value: trie.resolve(&old_entry.value)?,
                    new_value: trie.resolve(&new_entry.value)?,
                });
            }
        }
    }

    let old_children = old_view.map(|(c, node)| children_at(c, node)).unwrap_or_default();
    let new_children = new_view.map(|(c, node)| children_at(c, node)).unwrap_or_default();
    let bytes: BTreeSet<u8> = old_children.keys().chain(new_children.keys()).copied().collect();

    for byte in bytes {
        let mut child_path = path.clone();
        child_path.push(byte);
        stack.push(Frame {
            old: old_children.get(&byte).copied(),
            new: new_children.get(&byte).copied(),
            path: child_path,
        });
    }
    Ok(())
}

/// Equal content, whether each side is inline or a stored blob
fn same_value(a: &ValueRef, b: &ValueRef) -> bool {
    match (a, b) {
        (ValueRef::Inline(a), ValueRef::Inline(b)) => a == b,
        (ValueRef::Stored(a), ValueRef::Stored(b)) => a == b,
        (ValueRef::Inline(bytes), ValueRef::Stored(hash))
        | (ValueRef::Stored(hash), ValueRef::Inline(bytes)) => codec::value_digest(bytes) == *hash,
    }
}

fn entry_at(cursor: Cursor, node: &TrieNode) -> Option<&Entry> {
    if cursor.offset == node.path().len() {
        node.entry()
    } else {
        None
    }
}

fn children_at(cursor: Cursor, node: &TrieNode) -> BTreeMap<u8, Cursor> {
    let path = node.path();
    if cursor.offset < path.len() {
        let next = Cursor {
            hash: cursor.hash,
            offset: cursor.offset + 1,
        };
        return BTreeMap::from([(path[cursor.offset], next)]);
    }
    match node {
        TrieNode::Leaf { .. } => BTreeMap::new(),
        TrieNode::Branch { children, .. } => children
            .iter()
            .map(|(&byte, &hash)| (byte, Cursor { hash, offset: 0 }))
            .collect(),
    }
}

fn key_of(trie: &MerkleTrie, path: &[u8], entry: &Entry) -> Result<Vec<u8>> {
    match trie.ordering() {
        KeyOrdering::Lexicographic => Ok(path.to_vec()),
        KeyOrdering::Hashed => entry
            .key
            .clone()
            .ok_or_else(|| Error::CorruptState("Hashed entry without key".into())),
    }
}
