//! Version graph operations

use crate::model::{Commit, CommitInfo, Hash};
use crate::store::{BlobType, NodeStore};
use crate::{Error, Result};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

/// Meta record listing commits whose parents were pruned away
pub(crate) const SHALLOW_KEY: &str = "graph/shallow";

/// Read/write access to the commit DAG
///
/// Commits are stored as blobs in the same store as tree nodes and are
/// addressed by the digest of their encoding. A parent must exist before a
/// child can reference it, and logical timestamps strictly increase along
/// every parent edge, so no sequence of commits can form a cycle.
pub struct VersionGraph<'a> {
    store: &'a NodeStore,
}

impl<'a> VersionGraph<'a> {
    pub fn new(store: &'a NodeStore) -> Self {
        VersionGraph { store }
    }

    /// Record a new commit of `root` on top of `parents`
    pub fn commit(&self, root: Hash, parents: &[Hash], info: CommitInfo) -> Result<Hash> {
        check_distinct(parents)?;
        self.check_root(&root)?;

        let mut timestamp = 0;
        for (i, parent) in parents.iter().enumerate() {
            let commit = self
                .store
                .get_commit(parent)?
                .ok_or(Error::DanglingParent(*parent))?;
            timestamp = if i == 0 {
                commit.timestamp + 1
            } else {
                timestamp.max(commit.timestamp + 1)
            };
        }

        let commit = Commit::new(root, parents.to_vec(), timestamp, info);
        let id = self.store.put_commit(&commit)?;
        debug!(commit = %id.short(), root = %root.short(), parents = parents.len(), "Created commit");
        Ok(id)
    }

    /// Record a merge of `a` and `b` whose tree is `merge_root`
    ///
    /// How the two trees are combined is up to the caller; this only adds
    /// the two-parent commit.
    pub fn merge(&self, a: Hash, b: Hash, merge_root: Hash, info: CommitInfo) -> Result<Hash> {
        self.commit(merge_root, &[a, b], info)
    }

    /// Accept a commit built elsewhere, keeping its timestamp
    pub fn import(&self, commit: &Commit) -> Result<Hash> {
        check_distinct(&commit.parents)?;
        self.check_root(&commit.root)?;
        let id = commit.id()?;

        for parent in &commit.parents {
            if *parent == id {
                return Err(Error::CyclicHistory { commit: id, parent: *parent });
            }
            let parent_commit = self
                .store
                .get_commit(parent)?
                .ok_or(Error::DanglingParent(*parent))?;
            if parent_commit.timestamp >= commit.timestamp {
                return Err(Error::CyclicHistory { commit: id, parent: *parent });
            }
        }

        self.store.put_commit(commit)?;
        debug!(commit = %id.short(), "Imported commit");
        Ok(id)
    }

    pub fn get(&self, id: &Hash) -> Result<Commit> {
        self.store
            .get_commit(id)?
            .ok_or_else(|| Error::NotFound(format!("commit {}", id)))
    }

    pub fn contains(&self, id: &Hash) -> Result<bool> {
        Ok(self.store.blob_type(id)? == Some(BlobType::Commit))
    }

    /// Every commit reachable from `id` through parent links, excluding `id`
    ///
    /// Yields newest logical timestamp first (ties by ascending id), which
    /// places every commit after all of its descendants.
    pub fn ancestors(&self, id: &Hash) -> Result<Ancestors<'a>> {
        let commit = self.get(id)?;
        Ancestors::new(self.store, *id, commit, self.shallow()?, 0)
    }

    /// Whether `a` is `b` or reachable from `b` through parent links
    pub fn is_ancestor(&self, a: &Hash, b: &Hash) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        let target = self.get(a)?;
        let start = self.get(b)?;
        if target.timestamp >= start.timestamp {
            return Ok(false);
        }

        let walk = Ancestors::new(self.store, *b, start, self.shallow()?, target.timestamp)?;
        for found in walk {
            if found? == *a {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// `id` followed by its ancestors, at most `limit` entries
    pub fn log(&self, id: &Hash, limit: Option<usize>) -> Result<Vec<(Hash, Commit)>> {
        let limit = limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut result = vec![(*id, self.get(id)?)];
        for ancestor in self.ancestors(id)? {
            if result.len() >= limit {
                break;
            }
            let ancestor = ancestor?;
            result.push((ancestor, self.get(&ancestor)?));
        }
        Ok(result)
    }

    /// Commits retained without their parents by a horizon prune
    pub fn shallow(&self) -> Result<HashSet<Hash>> {
        match self.store.backend().get_meta(SHALLOW_KEY)? {
            Some(bytes) => {
                let list: Vec<Hash> = bincode::deserialize(&bytes)?;
                Ok(list.into_iter().collect())
            }
            None => Ok(HashSet::new()),
        }
    }

    pub(crate) fn set_shallow(&self, shallow: &HashSet<Hash>) -> Result<()> {
        if shallow.is_empty() {
            self.store.backend().delete_meta(SHALLOW_KEY)?;
            return Ok(());
        }
        let mut list: Vec<Hash> = shallow.iter().copied().collect();
        list.sort();
        self.store
            .backend()
            .put_meta(SHALLOW_KEY, &bincode::serialize(&list)?)
    }

    /// A stored top node implies its subtree: sweeps delete dead nodes
    /// before their children, so a cancelled one never leaves a partial tree
    fn check_root(&self, root: &Hash) -> Result<()> {
        if root.is_zero() {
            return Ok(());
        }
        match self.store.blob_type(root)? {
            Some(BlobType::Node) => Ok(()),
            _ => Err(Error::CorruptState(format!(
                "Commit root {} is not a stored node",
                root
            ))),
        }
    }
}

fn check_distinct(parents: &[Hash]) -> Result<()> {
    let mut seen = HashSet::new();
    for parent in parents {
        if !seen.insert(parent) {
            return Err(Error::InvalidCommit(format!("duplicate parent {}", parent)));
        }
    }
    Ok(())
}

/// Lazy walk over a commit's ancestors, see [`VersionGraph::ancestors`]
pub struct Ancestors<'a> {
    store: &'a NodeStore,
    shallow: HashSet<Hash>,
    /// Parents with a timestamp below this are not followed
    floor: u64,
    queue: BinaryHeap<(u64, Reverse<Hash>)>,
    parents: HashMap<Hash, Vec<Hash>>,
    seen: HashSet<Hash>,
    failed: bool,
}

impl<'a> Ancestors<'a> {
    fn new(
        store: &'a NodeStore,
        id: Hash,
        start: Commit,
        shallow: HashSet<Hash>,
        floor: u64,
    ) -> Result<Self> {
        let mut walk = Ancestors {
            store,
            shallow,
            floor,
            queue: BinaryHeap::new(),
            parents: HashMap::new(),
            seen: HashSet::from([id]),
            failed: false,
        };
        walk.enqueue_parents(&id, &start.parents)?;
        Ok(walk)
    }

    fn enqueue_parents(&mut self, child: &Hash, parents: &[Hash]) -> Result<()> {
        for parent in parents {
            if !self.seen.insert(*parent) {
                continue;
            }
            let Some(commit) = self.store.get_commit(parent)? else {
                if self.shallow.contains(child) {
                    continue;
                }
                return Err(Error::CorruptState(format!(
                    "Commit {} has unresolvable parent {}",
                    child, parent
                )));
            };
            if commit.timestamp < self.floor {
                continue;
            }
            self.queue.push((commit.timestamp, Reverse(*parent)));
            self.parents.insert(*parent, commit.parents);
        }
        Ok(())
    }
}

impl Iterator for Ancestors<'_> {
    type Item = Result<Hash>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (_, Reverse(id)) = self.queue.pop()?;
        let parents = self.parents.remove(&id).unwrap_or_default();
        if let Err(e) = self.enqueue_parents(&id, &parents) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok(id))
    }
}
