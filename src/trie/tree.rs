//! Persistent merkle trie over a node store

use super::{Entry, TrieNode, ValueRef};
use crate::config::{Config, KeyOrdering};
use crate::model::Hash;
use crate::store::NodeStore;
use crate::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

/// One mutation in a batch applied with [`MerkleTrie::apply`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl Change {
    pub fn key(&self) -> &[u8] {
        match self {
            Change::Put(key, _) | Change::Delete(key) => key,
        }
    }
}

/// A copy-on-write merkle trie
///
/// The trie itself holds no root: every operation takes the root digest of
/// the version to read or derive from (`Hash::ZERO` for the empty tree) and
/// writes return the digest of a new version. Existing versions are never
/// modified. A write persists only the nodes on the path from the changed
/// key up to the root; every other subtree is shared by digest.
pub struct MerkleTrie<'a> {
    store: &'a NodeStore,
    ordering: KeyOrdering,
    inline_threshold: usize,
}

enum Removal {
    Absent,
    Replaced(Option<Hash>),
}

impl<'a> MerkleTrie<'a> {
    pub fn new(store: &'a NodeStore, config: &Config) -> Self {
        MerkleTrie {
            store,
            ordering: config.ordering,
            inline_threshold: config.inline_threshold,
        }
    }

    pub fn ordering(&self) -> KeyOrdering {
        self.ordering
    }

    pub fn store(&self) -> &'a NodeStore {
        self.store
    }

    /// Look up a key; `Ok(None)` means the key is absent
    pub fn get(&self, root: Hash, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.get_entry(root, key)? {
            Some(entry) => Ok(Some(self.resolve(&entry.value)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, root: Hash, key: &[u8]) -> Result<bool> {
        Ok(self.get_entry(root, key)?.is_some())
    }

    /// The raw entry stored for a key, without resolving stored values
    pub fn get_entry(&self, root: Hash, key: &[u8]) -> Result<Option<Entry>> {
        if root.is_zero() {
            return Ok(None);
        }
        let path = self.ordering.path(key);
        let mut remaining: &[u8] = &path;
        let mut hash = root;

        loop {
            let node = self.load(&hash)?;
            match node.as_ref() {
                TrieNode::Leaf { suffix, entry } => {
                    return Ok((suffix.as_slice() == remaining).then(|| entry.clone()));
                }
                TrieNode::Branch {
                    prefix,
                    entry,
                    children,
                } => {
                    let Some(after) = remaining.strip_prefix(prefix.as_slice()) else {
                        return Ok(None);
                    };
                    match after.split_first() {
                        None => return Ok(entry.clone()),
                        Some((byte, rest)) => match children.get(byte) {
                            Some(child) => {
                                hash = *child;
                                remaining = rest;
                            }
                            None => return Ok(None),
                        },
                    }
                }
            }
        }
    }

    /// Insert or overwrite a key, returning the new root
    pub fn insert(&self, root: Hash, key: &[u8], value: &[u8]) -> Result<Hash> {
        let entry = self.make_entry(key, value)?;
        let path = self.ordering.path(key);
        self.insert_at(non_empty(root), &path, entry)
    }

    /// Remove a key, returning the new root (unchanged if the key is absent)
    pub fn remove(&self, root: Hash, key: &[u8]) -> Result<Hash> {
        if root.is_zero() {
            return Ok(root);
        }
        let path = self.ordering.path(key);
        match self.remove_at(root, &path)? {
            Removal::Absent => Ok(root),
            Removal::Replaced(new_root) => Ok(new_root.unwrap_or(Hash::ZERO)),
        }
    }

    /// Apply a batch of changes in order
    pub fn apply(&self, root: Hash, changes: &[Change]) -> Result<Hash> {
        changes.iter().try_fold(root, |root, change| match change {
            Change::Put(key, value) => self.insert(root, key, value),
            Change::Delete(key) => self.remove(root, key),
        })
    }

    /// Every key/value pair, in key order
    pub fn entries(&self, root: Hash) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.range(root, Bound::Unbounded, Bound::Unbounded)
    }

    /// Every key starting with `prefix`, in key order
    pub fn list_prefix(&self, root: Hash, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let upper = prefix_successor(prefix);
        let end = match &upper {
            Some(upper) => Bound::Excluded(upper.as_slice()),
            None => Bound::Unbounded,
        };
        self.range(root, Bound::Included(prefix), end)
    }

    /// Keys within `[start, end]` bounds, in key order
    ///
    /// Under lexicographic ordering, subtrees entirely outside the bounds are
    /// never loaded. Under hashed ordering keys are scattered, so this scans.
    pub fn range(
        &self,
        root: Hash,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let bounds = KeyBounds {
            start: owned(start),
            end: owned(end),
        };
        let mut found = Vec::new();
        if !root.is_zero() {
            self.collect(root, Vec::new(), &bounds, &mut found)?;
        }
        if self.ordering == KeyOrdering::Hashed {
            found.sort_by(|a, b| a.0.cmp(&b.0));
        }
        found
            .into_iter()
            .map(|(key, entry)| Ok((key, self.resolve(&entry.value)?)))
            .collect()
    }

    /// Number of keys in a version
    pub fn len(&self, root: Hash) -> Result<usize> {
        let mut count = 0;
        walk(self.store, root, &mut HashSet::new(), |_, node| {
            if node.entry().is_some() {
                count += 1;
            }
            Ok(())
        })?;
        Ok(count)
    }

    /// Digests of every node reachable from `root`
    pub fn node_digests(&self, root: Hash) -> Result<HashSet<Hash>> {
        let mut visited = HashSet::new();
        walk(self.store, root, &mut visited, |_, _| Ok(()))?;
        Ok(visited)
    }

    /// Resolve a value reference to its bytes
    pub fn resolve(&self, value: &ValueRef) -> Result<Vec<u8>> {
        match value {
            ValueRef::Inline(bytes) => Ok(bytes.clone()),
            ValueRef::Stored(hash) => self.store.load_value(hash),
        }
    }

    // === Internal helpers ===

    pub(crate) fn load(&self, hash: &Hash) -> Result<Arc<TrieNode>> {
        let (ordering, node) = self.store.load_node(hash)?;
        if ordering != self.ordering {
            return Err(Error::CorruptState(format!(
                "Node {} was written with {:?} ordering, trie uses {:?}",
                hash, ordering, self.ordering
            )));
        }
        Ok(node)
    }

    fn persist(&self, node: &TrieNode) -> Result<Hash> {
        self.store.put_node(self.ordering, node)
    }

    fn make_entry(&self, key: &[u8], value: &[u8]) -> Result<Entry> {
        let value = if value.len() <= self.inline_threshold {
            ValueRef::Inline(value.to_vec())
        } else {
            ValueRef::Stored(self.store.put_value(value)?)
        };
        let key = match self.ordering {
            KeyOrdering::Lexicographic => None,
            KeyOrdering::Hashed => Some(key.to_vec()),
        };
        Ok(Entry { key, value })
    }

    fn insert_at(&self, node: Option<Hash>, remaining: &[u8], entry: Entry) -> Result<Hash> {
        let Some(hash) = node else {
            return self.persist(&TrieNode::leaf(remaining.to_vec(), entry));
        };
        let node = self.load(&hash)?;

        match node.as_ref() {
            TrieNode::Leaf {
                suffix,
                entry: existing,
            } => {
                if suffix.as_slice() == remaining {
                    return self.persist(&TrieNode::leaf(remaining.to_vec(), entry));
                }

                // Split into a branch at the divergence point
                let common = common_prefix_len(remaining, suffix);
                let mut children = BTreeMap::new();
                let mut branch_entry = None;

                if common == suffix.len() {
                    branch_entry = Some(existing.clone());
                } else {
                    let old = TrieNode::leaf(suffix[common + 1..].to_vec(), existing.clone());
                    children.insert(suffix[common], self.persist(&old)?);
                }

                if common == remaining.len() {
                    branch_entry = Some(entry);
                } else {
                    let new = TrieNode::leaf(remaining[common + 1..].to_vec(), entry);
                    children.insert(remaining[common], self.persist(&new)?);
                }

                self.persist(&TrieNode::Branch {
                    prefix: remaining[..common].to_vec(),
                    entry: branch_entry,
                    children,
                })
            }
            TrieNode::Branch {
                prefix,
                entry: branch_entry,
                children,
            } => {
                let common = common_prefix_len(remaining, prefix);

                if common < prefix.len() {
                    // The key leaves this branch's prefix early: push the
                    // existing branch one level down
                    let pushed = TrieNode::Branch {
                        prefix: prefix[common + 1..].to_vec(),
                        entry: branch_entry.clone(),
                        children: children.clone(),
                    };
                    let mut new_children = BTreeMap::new();
                    new_children.insert(prefix[common], self.persist(&pushed)?);

                    let mut top_entry = None;
                    if common == remaining.len() {
                        top_entry = Some(entry);
                    } else {
                        let new = TrieNode::leaf(remaining[common + 1..].to_vec(), entry);
                        new_children.insert(remaining[common], self.persist(&new)?);
                    }

                    return self.persist(&TrieNode::Branch {
                        prefix: remaining[..common].to_vec(),
                        entry: top_entry,
                        children: new_children,
                    });
                }

                let mut new_entry = branch_entry.clone();
                let mut new_children = children.clone();
                match remaining[common..].split_first() {
                    None => new_entry = Some(entry),
                    Some((&byte, rest)) => {
                        let child = self.insert_at(children.get(&byte).copied(), rest, entry)?;
                        new_children.insert(byte, child);
                    }
                }

                self.persist(&TrieNode::Branch {
                    prefix: prefix.clone(),
                    entry: new_entry,
                    children: new_children,
                })
            }
        }
    }

    fn remove_at(&self, hash: Hash, remaining: &[u8]) -> Result<Removal> {
        let node = self.load(&hash)?;

        match node.as_ref() {
            TrieNode::Leaf { suffix, .. } => Ok(if suffix.as_slice() == remaining {
                Removal::Replaced(None)
            } else {
                Removal::Absent
            }),
            TrieNode::Branch {
                prefix,
                entry,
                children,
            } => {
                let Some(after) = remaining.strip_prefix(prefix.as_slice()) else {
                    return Ok(Removal::Absent);
                };
                match after.split_first() {
                    None => {
                        if entry.is_none() {
                            return Ok(Removal::Absent);
                        }
                        let replaced = self.normalize(prefix, None, children.clone())?;
                        Ok(Removal::Replaced(replaced))
                    }
                    Some((&byte, rest)) => {
                        let Some(&child) = children.get(&byte) else {
                            return Ok(Removal::Absent);
                        };
                        match self.remove_at(child, rest)? {
                            Removal::Absent => Ok(Removal::Absent),
                            Removal::Replaced(new_child) => {
                                let mut children = children.clone();
                                match new_child {
                                    Some(h) => children.insert(byte, h),
                                    None => children.remove(&byte),
                                };
                                let replaced = self.normalize(prefix, entry.clone(), children)?;
                                Ok(Removal::Replaced(replaced))
                            }
                        }
                    }
                }
            }
        }
    }

    /// Rebuild a branch after a removal, restoring the canonical layout
    fn normalize(
        &self,
        prefix: &[u8],
        entry: Option<Entry>,
        children: BTreeMap<u8, Hash>,
    ) -> Result<Option<Hash>> {
        if children.is_empty() {
            return match entry {
                Some(entry) => Ok(Some(self.persist(&TrieNode::leaf(prefix.to_vec(), entry))?)),
                None => Ok(None),
            };
        }

        if entry.is_none() && children.len() == 1 {
            if let Some((&byte, child)) = children.iter().next() {
                // Single child and nothing here: fold this node into the child
                let mut head = prefix.to_vec();
                head.push(byte);
                let merged = self.load(child)?.as_ref().clone().with_path_prefix(&head);
                return Ok(Some(self.persist(&merged)?));
            }
        }

        Ok(Some(self.persist(&TrieNode::Branch {
            prefix: prefix.to_vec(),
            entry,
            children,
        })?))
    }

    fn collect(
        &self,
        hash: Hash,
        mut path: Vec<u8>,
        bounds: &KeyBounds,
        out: &mut Vec<(Vec<u8>, Entry)>,
    ) -> Result<()> {
        let node = self.load(&hash)?;
        path.extend_from_slice(node.path());

        let lexicographic = self.ordering == KeyOrdering::Lexicographic;
        if lexicographic && bounds.excludes_subtree(&path) {
            return Ok(());
        }

        if let Some(entry) = node.entry() {
            let key = match self.ordering {
                KeyOrdering::Lexicographic => path.clone(),
                KeyOrdering::Hashed => entry.key.clone().ok_or_else(|| {
                    Error::CorruptState(format!("Hashed entry without key in node {}", hash))
                })?,
            };
            if bounds.contains(&key) {
                out.push((key, entry.clone()));
            }
        }

        if let TrieNode::Branch { children, .. } = node.as_ref() {
            for (&byte, &child) in children {
                let mut child_path = path.clone();
                child_path.push(byte);
                self.collect(child, child_path, bounds, out)?;
            }
        }
        Ok(())
    }
}

/// Depth-first walk over every node reachable from `root`, visiting each
/// digest at most once across calls sharing `visited`
pub(crate) fn walk<F>(
    store: &NodeStore,
    root: Hash,
    visited: &mut HashSet<Hash>,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(&Hash, &TrieNode) -> Result<()>,
{
    if root.is_zero() {
        return Ok(());
    }
    let mut stack = vec![root];
    while let Some(hash) = stack.pop() {
        if !visited.insert(hash) {
            continue;
        }
        let (_, node) = store.load_node(&hash)?;
        visit(&hash, &node)?;
        stack.extend(
            node.child_hashes()
                .into_iter()
                .filter(|child| !visited.contains(child)),
        );
    }
    Ok(())
}

struct KeyBounds {
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
}

impl KeyBounds {
    fn contains(&self, key: &[u8]) -> bool {
        let above_start = match &self.start {
            Bound::Included(s) => key >= s.as_slice(),
            Bound::Excluded(s) => key > s.as_slice(),
            Bound::Unbounded => true,
        };
        let below_end = match &self.end {
            Bound::Included(e) => key <= e.as_slice(),
            Bound::Excluded(e) => key < e.as_slice(),
            Bound::Unbounded => true,
        };
        above_start && below_end
    }

    /// Whether no key starting with `path` can fall within the bounds
    fn excludes_subtree(&self, path: &[u8]) -> bool {
        // every key below is >= path
        let past_end = match &self.end {
            Bound::Included(e) => path > e.as_slice(),
            Bound::Excluded(e) => path >= e.as_slice(),
            Bound::Unbounded => false,
        };
        // every key below sorts before start unless path is a prefix of it
        let before_start = match &self.start {
            Bound::Included(s) | Bound::Excluded(s) => {
                path < s.as_slice() && !s.starts_with(path)
            }
            Bound::Unbounded => false,
        };
        past_end || before_start
    }
}

fn owned(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(b) => Bound::Included(b.to_vec()),
        Bound::Excluded(b) => Bound::Excluded(b.to_vec()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn non_empty(root: Hash) -> Option<Hash> {
    (!root.is_zero()).then_some(root)
}

/// Smallest byte string greater than every string starting with `prefix`
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// Find the length of the common prefix between two byte slices
fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
