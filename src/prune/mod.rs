//! Mark-and-sweep reclamation of unreachable history
//!
//! Reachability is the only thing that keeps a blob alive: there are no
//! reference counts. A prune runs in two phases:
//!
//! 1. **Mark** everything reachable from the retention set: the retained
//!    commits and their ancestors (up to an optional horizon), every node
//!    under their roots and every value blob those nodes point at. The
//!    result is written to the backend as a mark record.
//! 2. **Sweep** every stored blob outside the mark, one delete at a time,
//!    commits first. The mark record is then cleared.
//!
//! Nothing is deleted until the mark phase has resolved every digest it
//! needed, so a corrupt store aborts the prune instead of losing data. If
//! the process dies mid-sweep, [`Pruner::recover`] finishes the job from the
//! surviving mark record.

mod policy;

pub use policy::{CancelToken, PruneReport, RetentionPolicy};

use crate::graph::VersionGraph;
use crate::model::Hash;
use crate::ops::BranchTable;
use crate::store::{BlobType, NodeStore};
use crate::trie::{walk, ValueRef};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

const MARK_KEY: &str = "prune/mark";

/// Everything a sweep needs, persisted between mark and sweep
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MarkRecord {
    pub commits: Vec<Hash>,
    pub nodes: Vec<Hash>,
    pub values: Vec<Hash>,
    /// Live commits with at least one parent outside the live set
    pub shallow: Vec<Hash>,
}

impl MarkRecord {
    fn live(&self) -> HashSet<Hash> {
        self.commits
            .iter()
            .chain(&self.nodes)
            .chain(&self.values)
            .copied()
            .collect()
    }
}

pub struct Pruner<'a> {
    store: &'a NodeStore,
    cancel: CancelToken,
}

impl<'a> Pruner<'a> {
    pub fn new(store: &'a NodeStore) -> Self {
        Pruner {
            store,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Delete everything not reachable from `policy`'s retention set
    ///
    /// Fails with [`Error::BranchNotRetained`] if some branch head would be
    /// removed, and with [`Error::Cancelled`] if cancelled while marking. A
    /// cancellation during the sweep is reported in the result instead.
    pub fn prune(&self, policy: &RetentionPolicy) -> Result<PruneReport> {
        if let Some(report) = self.recover()? {
            debug!(removed = report.removed_total(), "Finished interrupted prune first");
        }

        let record = self.mark(policy)?;
        self.write_mark(&record)?;
        self.sweep(&record)
    }

    /// Complete a sweep left unfinished by a crash
    ///
    /// Returns `None` when there was nothing to recover.
    pub fn recover(&self) -> Result<Option<PruneReport>> {
        let Some(bytes) = self.store.backend().get_meta(MARK_KEY)? else {
            return Ok(None);
        };
        let record: MarkRecord = bincode::deserialize(&bytes)
            .map_err(|e| Error::CorruptState(format!("Unreadable prune mark record: {}", e)))?;

        warn!(
            live_commits = record.commits.len(),
            live_nodes = record.nodes.len(),
            "Resuming interrupted prune"
        );
        self.sweep(&record).map(Some)
    }

    pub(crate) fn mark(&self, policy: &RetentionPolicy) -> Result<MarkRecord> {
        let graph = VersionGraph::new(self.store);
        let branches = BranchTable::new(self.store);

        let retained = self.retention_set(policy, &graph, &branches)?;
        let commits = self.live_commits(&retained, policy, &graph)?;

        for (name, head) in branches.list()? {
            if !commits.contains_key(&head) {
                return Err(Error::BranchNotRetained(name));
            }
        }

        let mut live: Vec<Hash> = commits.keys().copied().collect();
        live.sort();

        let mut shallow = Vec::new();
        let mut nodes = HashSet::new();
        let mut values = HashSet::new();
        for id in &live {
            let commit = &commits[id];
            if commit.parents.iter().any(|p| !commits.contains_key(p)) {
                shallow.push(*id);
            }

            walk(self.store, commit.root, &mut nodes, |hash, node| {
                self.check_cancelled()?;
                if let Some(entry) = node.entry() {
                    if let ValueRef::Stored(value) = &entry.value {
                        if !self.store.contains(value)? {
                            return Err(Error::CorruptState(format!(
                                "Node {} references missing value {}",
                                hash, value
                            )));
                        }
                        values.insert(*value);
                    }
                }
                Ok(())
            })?;
        }

        info!(
            retained = retained.len(),
            live_commits = live.len(),
            live_nodes = nodes.len(),
            live_values = values.len(),
            shallow = shallow.len(),
            "Marked live data"
        );

        Ok(MarkRecord {
            commits: live,
            nodes: nodes.into_iter().collect(),
            values: values.into_iter().collect(),
            shallow,
        })
    }

    pub(crate) fn write_mark(&self, record: &MarkRecord) -> Result<()> {
        self.store
            .backend()
            .put_meta(MARK_KEY, &bincode::serialize(record)?)?;
        self.store.flush()
    }

    pub(crate) fn sweep(&self, record: &MarkRecord) -> Result<PruneReport> {
        let live = record.live();
        let mut report = PruneReport {
            live_commits: record.commits.len(),
            live_nodes: record.nodes.len(),
            ..Default::default()
        };

        // Shallow commits must be known before their parents disappear
        VersionGraph::new(self.store).set_shallow(&record.shallow.iter().copied().collect())?;

        let doomed = self.sweep_order(&live)?;

        for (hash, blob_type) in doomed {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !self.store.delete(&hash)? {
                continue;
            }
            match blob_type {
                BlobType::Commit => report.removed_commits += 1,
                BlobType::Node => report.removed_nodes += 1,
                BlobType::Value => report.removed_values += 1,
            }
        }

        self.store.backend().delete_meta(MARK_KEY)?;
        self.store.flush()?;

        info!(
            removed_commits = report.removed_commits,
            removed_nodes = report.removed_nodes,
            removed_values = report.removed_values,
            cancelled = report.cancelled,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Every unmarked blob, in deletion order
    ///
    /// Commits go first, then nodes with every dead parent ahead of its
    /// children, then values. A sweep stopped at any point therefore leaves
    /// each surviving node with its whole subtree.
    pub(crate) fn sweep_order(&self, live: &HashSet<Hash>) -> Result<Vec<(Hash, BlobType)>> {
        let mut commits = Vec::new();
        let mut nodes = Vec::new();
        let mut values = Vec::new();
        for hash in self.store.digests()? {
            if live.contains(&hash) {
                continue;
            }
            match self.store.blob_type(&hash)? {
                Some(BlobType::Commit) => commits.push(hash),
                Some(BlobType::Node) => nodes.push(hash),
                Some(BlobType::Value) => values.push(hash),
                None => {}
            }
        }
        commits.sort();
        values.sort();

        let dead: HashSet<Hash> = nodes.iter().copied().collect();
        let mut parents_left: HashMap<Hash, usize> = nodes.iter().map(|h| (*h, 0)).collect();
        let mut edges: HashMap<Hash, Vec<Hash>> = HashMap::new();
        for hash in &nodes {
            let children = match self.store.load_node(hash) {
                Ok((_, node)) => node.child_hashes(),
                Err(e) => {
                    warn!(node = %hash, error = %e, "Undecodable dead node");
                    Vec::new()
                }
            };
            for child in children.into_iter().filter(|c| dead.contains(c)) {
                *parents_left.entry(child).or_default() += 1;
                edges.entry(*hash).or_default().push(child);
            }
        }

        let mut ready: BTreeSet<Hash> = parents_left
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(h, _)| *h)
            .collect();
        let mut ordered_nodes = Vec::with_capacity(nodes.len());
        while let Some(hash) = ready.pop_first() {
            ordered_nodes.push(hash);
            for child in edges.remove(&hash).unwrap_or_default() {
                if let Some(n) = parents_left.get_mut(&child) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(child);
                    }
                }
            }
        }

        Ok(commits
            .into_iter()
            .map(|h| (h, BlobType::Commit))
            .chain(ordered_nodes.into_iter().map(|h| (h, BlobType::Node)))
            .chain(values.into_iter().map(|h| (h, BlobType::Value)))
            .collect())
    }

    fn retention_set(
        &self,
        policy: &RetentionPolicy,
        graph: &VersionGraph,
        branches: &BranchTable,
    ) -> Result<Vec<Hash>> {
        let mut retained = Vec::new();
        for commit in &policy.commits {
            if !graph.contains(commit)? {
                return Err(Error::NotFound(format!("commit {}", commit)));
            }
            retained.push(*commit);
        }
        for name in &policy.branches {
            retained.push(branches.head(name)?);
        }
        if policy.all_branches {
            retained.extend(branches.list()?.into_iter().map(|(_, head)| head));
        }
        retained.sort();
        retained.dedup();
        Ok(retained)
    }

    /// Breadth-first over parent links from the retention set
    fn live_commits(
        &self,
        retained: &[Hash],
        policy: &RetentionPolicy,
        graph: &VersionGraph,
    ) -> Result<HashMap<Hash, crate::model::Commit>> {
        let known_shallow = graph.shallow()?;
        let mut live = HashMap::new();
        let mut queue: VecDeque<(Hash, usize)> = retained.iter().map(|h| (*h, 0)).collect();

        for id in retained {
            live.insert(*id, graph.get(id)?);
        }

        while let Some((id, depth)) = queue.pop_front() {
            self.check_cancelled()?;
            if policy.max_depth.is_some_and(|max| depth >= max) {
                continue;
            }
            let parents = live[&id].parents.clone();
            for parent in parents {
                if live.contains_key(&parent) {
                    continue;
                }
                let Some(commit) = self.store.get_commit(&parent)? else {
                    if known_shallow.contains(&id) {
                        continue;
                    }
                    return Err(Error::CorruptState(format!(
                        "Commit {} has unresolvable parent {}",
                        id, parent
                    )));
                };
                if policy.min_timestamp.is_some_and(|min| commit.timestamp < min) {
                    continue;
                }
                live.insert(parent, commit);
                queue.push_back((parent, depth + 1));
            }
        }
        Ok(live)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::CommitInfo;
    use crate::trie::MerkleTrie;

    struct Fixture {
        store: NodeStore,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let config = Config::default();
            Fixture {
                store: NodeStore::in_memory(&config),
                config,
            }
        }

        fn trie(&self) -> MerkleTrie<'_> {
            MerkleTrie::new(&self.store, &self.config)
        }

        fn graph(&self) -> VersionGraph<'_> {
            VersionGraph::new(&self.store)
        }

        /// Commit a chain of single-key versions, returning (commit, root) pairs
        fn chain(&self, len: usize) -> Vec<(Hash, Hash)> {
            let mut out = Vec::new();
            let mut root = Hash::ZERO;
            let mut parent: Option<Hash> = None;
            for i in 0..len {
                root = self
                    .trie()
                    .insert(root, format!("key{}", i).as_bytes(), &vec![i as u8; 64])
                    .unwrap();
                let parents: Vec<Hash> = parent.into_iter().collect();
                let id = self
                    .graph()
                    .commit(root, &parents, CommitInfo::message(format!("v{}", i)))
                    .unwrap();
                out.push((id, root));
                parent = Some(id);
            }
            out
        }
    }

    #[test]
    fn test_prune_keeps_retained_versions_intact() {
        let fx = Fixture::new();
        let trie = fx.trie();
        let a_root = trie.insert(Hash::ZERO, b"x", b"1").unwrap();
        let a = fx.graph().commit(a_root, &[], CommitInfo::message("A")).unwrap();
        let b_root = trie.insert(a_root, b"x", b"2").unwrap();
        let b = fx.graph().commit(b_root, &[a], CommitInfo::message("B")).unwrap();

        let report = Pruner::new(&fx.store)
            .prune(&RetentionPolicy::commits([b]))
            .unwrap();

        assert_eq!(trie.get(b_root, b"x").unwrap(), Some(b"2".to_vec()));
        // full history of B is retained, so A survives as an ancestor
        assert_eq!(report.removed_commits, 0);
        assert_eq!(report.removed_nodes, 0);
        assert!(fx.graph().contains(&a).unwrap());
    }

    #[test]
    fn test_prune_depth_horizon() {
        let fx = Fixture::new();
        let chain = fx.chain(5);
        let (tip, tip_root) = chain[4];

        let expected = fx.trie().entries(tip_root).unwrap();
        let report = Pruner::new(&fx.store)
            .prune(&RetentionPolicy::commits([tip]).with_max_depth(2))
            .unwrap();

        assert_eq!(report.live_commits, 3);
        assert_eq!(report.removed_commits, 2);
        assert!(report.removed_nodes > 0);
        assert!(!report.cancelled);

        for (id, _) in &chain[..2] {
            assert!(!fx.graph().contains(id).unwrap());
        }
        assert_eq!(fx.trie().entries(tip_root).unwrap(), expected);

        // history walks stop cleanly at the shallow boundary
        assert_eq!(fx.graph().shallow().unwrap(), HashSet::from([chain[2].0]));
        let log = fx.graph().log(&tip, None).unwrap();
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_prune_refuses_to_drop_branch_heads() {
        let fx = Fixture::new();
        let chain = fx.chain(3);
        BranchTable::new(&fx.store).create("old", chain[0].0).unwrap();

        let before = fx.store.digests().unwrap().len();
        let err = Pruner::new(&fx.store)
            .prune(&RetentionPolicy::commits([chain[2].0]).with_max_depth(0))
            .unwrap_err();
        assert!(matches!(err, Error::BranchNotRetained(name) if name == "old"));
        assert_eq!(fx.store.digests().unwrap().len(), before);

        // keeping every branch satisfies the check
        Pruner::new(&fx.store)
            .prune(
                &RetentionPolicy::commits([chain[2].0])
                    .with_max_depth(0)
                    .with_all_branches(),
            )
            .unwrap();
        assert!(fx.graph().contains(&chain[0].0).unwrap());
        assert!(!fx.graph().contains(&chain[1].0).unwrap());
    }

    #[test]
    fn test_min_timestamp_horizon() {
        let fx = Fixture::new();
        let chain = fx.chain(4);
        let report = Pruner::new(&fx.store)
            .prune(&RetentionPolicy::commits([chain[3].0]).with_min_timestamp(2))
            .unwrap();
        assert_eq!(report.live_commits, 2);
        assert!(fx.graph().contains(&chain[2].0).unwrap());
        assert!(!fx.graph().contains(&chain[1].0).unwrap());
    }

    #[test]
    fn test_missing_node_aborts_before_deleting() {
        let fx = Fixture::new();
        let chain = fx.chain(3);
        let leaf = fx
            .trie()
            .node_digests(chain[2].1)
            .unwrap()
            .into_iter()
            .find(|h| *h != chain[2].1)
            .unwrap();
        fx.store.delete(&leaf).unwrap();

        let before = fx.store.digests().unwrap().len();
        let err = Pruner::new(&fx.store)
            .prune(&RetentionPolicy::commits([chain[2].0]).with_max_depth(0))
            .unwrap_err();
        assert!(matches!(err, Error::CorruptState(_)));
        assert_eq!(fx.store.digests().unwrap().len(), before);
    }

    #[test]
    fn test_cancel_during_mark() {
        let fx = Fixture::new();
        let chain = fx.chain(3);
        let token = CancelToken::new();
        token.cancel();

        let before = fx.store.digests().unwrap().len();
        let result = Pruner::new(&fx.store)
            .with_cancel(token)
            .prune(&RetentionPolicy::commits([chain[2].0]).with_max_depth(0));
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(fx.store.digests().unwrap().len(), before);
    }

    #[test]
    fn test_cancel_during_sweep_leaves_only_extra_data() {
        let fx = Fixture::new();
        let chain = fx.chain(3);
        let token = CancelToken::new();
        let pruner = Pruner::new(&fx.store).with_cancel(token.clone());

        let record = pruner
            .mark(&RetentionPolicy::commits([chain[2].0]).with_max_depth(0))
            .unwrap();
        pruner.write_mark(&record).unwrap();
        token.cancel();

        let report = pruner.sweep(&record).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.removed_total(), 0);
        assert_eq!(fx.trie().len(chain[2].1).unwrap(), 3);
        assert!(fx.store.backend().get_meta(MARK_KEY).unwrap().is_none());
    }

    #[test]
    fn test_recover_finishes_interrupted_sweep() {
        let fx = Fixture::new();
        let chain = fx.chain(3);
        let pruner = Pruner::new(&fx.store);
        assert!(pruner.recover().unwrap().is_none());

        let record = pruner
            .mark(&RetentionPolicy::commits([chain[2].0]).with_max_depth(0))
            .unwrap();
        pruner.write_mark(&record).unwrap();
        // crash here: the record survives, nothing was deleted yet

        let report = Pruner::new(&fx.store).recover().unwrap().unwrap();
        assert_eq!(report.removed_commits, 2);
        assert!(!fx.graph().contains(&chain[0].0).unwrap());
        assert_eq!(fx.trie().len(chain[2].1).unwrap(), 3);
        assert!(pruner.recover().unwrap().is_none());
    }

    #[test]
    fn test_unknown_retained_commit() {
        let fx = Fixture::new();
        let result = Pruner::new(&fx.store).prune(&RetentionPolicy::commits([Hash::digest(b"?")]));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_sweep_order_keeps_survivors_complete() {
        let fx = Fixture::new();
        let chain = fx.chain(2);
        // versions written but never committed
        let mut orphan = chain[1].1;
        for i in 0..20u32 {
            orphan = fx
                .trie()
                .insert(orphan, format!("orphan{:02}", i).as_bytes(), &[i as u8; 48])
                .unwrap();
        }

        let pruner = Pruner::new(&fx.store);
        let record = pruner.mark(&RetentionPolicy::commits([chain[1].0])).unwrap();
        let live = record.live();
        let order = pruner.sweep_order(&live).unwrap();
        assert!(order.iter().any(|(h, _)| *h == orphan));

        let position: HashMap<Hash, usize> =
            order.iter().enumerate().map(|(i, (h, _))| (*h, i)).collect();
        for (i, (hash, blob_type)) in order.iter().enumerate() {
            if *blob_type != BlobType::Node {
                continue;
            }
            let (_, node) = fx.store.load_node(hash).unwrap();
            let mut refs = node.child_hashes();
            if let Some(ValueRef::Stored(value)) = node.entry().map(|e| &e.value) {
                refs.push(*value);
            }
            // whatever `hash` points at is live or goes after it
            for r in refs {
                assert!(live.contains(&r) || position[&r] > i);
            }
        }
    }
}
