//! High-level Database API
//!
//! This module provides the main entry point for interacting with rhizome_trees.

use crate::config::Config;
use crate::graph::VersionGraph;
use crate::model::{CommitInfo, Hash};
use crate::ops::{diff_trees, validate_name, BranchTable, Diff};
use crate::proof::{prove, Proof};
use crate::prune::{CancelToken, PruneReport, Pruner, RetentionPolicy};
use crate::store::{Backend, FileBackend, MemoryBackend, NodeStore};
use crate::trie::{Change, MerkleTrie};
use crate::{viz, Error, Result};
use parking_lot::{RwLock, RwLockReadGuard};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const ORDERING_KEY: &str = "config/ordering";
const INLINE_THRESHOLD_KEY: &str = "config/inline_threshold";

/// The main database interface
///
/// Wires one node store to the tree, version graph, branch table, proof
/// engine and pruner. Everything except pruning may run concurrently from
/// many threads; a prune waits for in-flight writes and blocks new ones
/// until it finishes, so nodes written for a commit that is about to be
/// created cannot be swept from under it.
///
/// Writes through [`Database::write`] produce roots that nothing retains
/// yet. They are protected only while the call runs; commit them (or use
/// [`Database::apply`], which writes, commits and moves a branch under one
/// hold) before the next prune.
pub struct Database {
    store: NodeStore,
    config: Config,
    file: Option<Arc<FileBackend>>,
    gc: RwLock<()>,
}

/// Branch table access for a [`Database`]
///
/// Holds the database's GC lock shared while alive, so branches cannot move
/// between a prune's mark and its sweep. Drop it before calling writes or
/// a prune on the same thread.
pub struct Branches<'a> {
    table: BranchTable<'a>,
    _gc: RwLockReadGuard<'a, ()>,
}

impl<'a> Deref for Branches<'a> {
    type Target = BranchTable<'a>;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

impl Database {
    /// Create a new database at the given path
    pub fn create(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let file = Arc::new(FileBackend::create(path, config.sync_writes)?);
        Self::init(file.clone(), Some(file), config)
    }

    /// Open an existing database
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let file = Arc::new(FileBackend::open(path, config.sync_writes)?);
        Self::init(file.clone(), Some(file), config)
    }

    /// Open or create a database
    pub fn open_or_create(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let file = Arc::new(FileBackend::open_or_create(path, config.sync_writes)?);
        Self::init(file.clone(), Some(file), config)
    }

    pub fn in_memory(config: Config) -> Result<Self> {
        Self::with_backend(Arc::new(MemoryBackend::new()), config)
    }

    /// Use a caller-supplied backend
    pub fn with_backend(backend: Arc<dyn Backend>, config: Config) -> Result<Self> {
        config.validate()?;
        Self::init(backend, None, config)
    }

    fn init(backend: Arc<dyn Backend>, file: Option<Arc<FileBackend>>, config: Config) -> Result<Self> {
        check_recorded(backend.as_ref(), ORDERING_KEY, &[config.ordering.as_byte()], || {
            format!("key ordering {:?}", config.ordering)
        })?;
        // inline vs stored changes node bytes
        let threshold = (config.inline_threshold as u64).to_le_bytes();
        check_recorded(backend.as_ref(), INLINE_THRESHOLD_KEY, &threshold, || {
            format!("inline_threshold {}", config.inline_threshold)
        })?;

        let store = NodeStore::new(backend, &config);
        if let Some(report) = Pruner::new(&store).recover()? {
            info!(removed = report.removed_total(), "Completed interrupted prune");
        }
        debug!(ordering = ?config.ordering, "Opened database");

        Ok(Database {
            store,
            config,
            file,
            gc: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn tree(&self) -> MerkleTrie<'_> {
        MerkleTrie::new(&self.store, &self.config)
    }

    pub fn graph(&self) -> VersionGraph<'_> {
        VersionGraph::new(&self.store)
    }

    /// The branch table, with the GC lock held shared until dropped
    pub fn branches(&self) -> Branches<'_> {
        Branches {
            _gc: self.gc.read_recursive(),
            table: BranchTable::new(&self.store),
        }
    }

    // === Tree Operations ===

    pub fn get(&self, root: Hash, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree().get(root, key)
    }

    /// Insert or overwrite a key, returning the new root
    pub fn write(&self, root: Hash, key: &[u8], value: &[u8]) -> Result<Hash> {
        let _gc = self.gc.read();
        self.tree().insert(root, key, value)
    }

    /// Remove a key, returning the new root
    pub fn delete(&self, root: Hash, key: &[u8]) -> Result<Hash> {
        let _gc = self.gc.read();
        self.tree().remove(root, key)
    }

    /// Apply `changes` on top of a branch's head, commit, and advance it
    ///
    /// A missing branch is created from the empty tree. Returns the new
    /// commit id; fails with [`Error::ConcurrentBranchUpdate`] if the branch
    /// moved in the meantime (the new commit then exists but is unreferenced).
    pub fn apply(&self, branch: &str, changes: &[Change], info: CommitInfo) -> Result<Hash> {
        validate_name(branch)?;
        let _gc = self.gc.read();
        let branches = BranchTable::new(&self.store);
        let graph = self.graph();

        let head = branches.get(branch)?;
        let base = match &head {
            Some(commit) => graph.get(commit)?.root,
            None => Hash::ZERO,
        };

        let root = self.tree().apply(base, changes)?;
        let parents: Vec<Hash> = head.into_iter().collect();
        let commit = graph.commit(root, &parents, info)?;
        branches.compare_and_swap(branch, head, Some(commit))?;
        Ok(commit)
    }

    // === Version Control ===

    pub fn commit(&self, root: Hash, parents: &[Hash], info: CommitInfo) -> Result<Hash> {
        let _gc = self.gc.read();
        self.graph().commit(root, parents, info)
    }

    pub fn merge(&self, a: Hash, b: Hash, merge_root: Hash, info: CommitInfo) -> Result<Hash> {
        let _gc = self.gc.read();
        self.graph().merge(a, b, merge_root, info)
    }

    /// Resolve a branch name or full hex commit id
    pub fn resolve(&self, reference: &str) -> Result<Hash> {
        if validate_name(reference).is_ok() {
            if let Some(commit) = self.branches().get(reference)? {
                return Ok(commit);
            }
        }
        if let Ok(hash) = Hash::from_hex(reference) {
            if self.graph().contains(&hash)? {
                return Ok(hash);
            }
        }
        Err(Error::NotFound(format!("branch or commit {}", reference)))
    }

    /// Tree root of a commit
    pub fn root_of(&self, commit: &Hash) -> Result<Hash> {
        Ok(self.graph().get(commit)?.root)
    }

    // === Proofs, Diffs, Export ===

    pub fn prove(&self, root: Hash, key: &[u8]) -> Result<Proof> {
        prove(&self.store, self.config.ordering, root, key)
    }

    pub fn diff(&self, old_root: Hash, new_root: Hash) -> Result<Diff> {
        diff_trees(&self.tree(), old_root, new_root)
    }

    /// Graphviz rendering of the given versions
    pub fn to_dot(&self, versions: &[(String, Hash)]) -> Result<String> {
        viz::to_dot(&self.tree(), versions)
    }

    // === Maintenance ===

    pub fn prune(&self, policy: &RetentionPolicy) -> Result<PruneReport> {
        self.prune_with_cancel(policy, CancelToken::new())
    }

    pub fn prune_with_cancel(&self, policy: &RetentionPolicy, cancel: CancelToken) -> Result<PruneReport> {
        let _gc = self.gc.write();
        Pruner::new(&self.store).with_cancel(cancel).prune(policy)
    }

    /// Rewrite the database file without dead records
    ///
    /// Returns bytes reclaimed, or `None` for backends without a file.
    pub fn compact(&self) -> Result<Option<u64>> {
        let _gc = self.gc.write();
        match &self.file {
            Some(file) => Ok(Some(file.compact()?)),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

/// Record a layout setting on first open; afterwards it must match
fn check_recorded(
    backend: &dyn Backend,
    key: &str,
    value: &[u8],
    describe: impl FnOnce() -> String,
) -> Result<()> {
    match backend.get_meta(key)? {
        Some(recorded) if recorded == value => Ok(()),
        Some(_) => Err(Error::Config(format!(
            "database was created with a different {}, config asks for {}",
            key,
            describe()
        ))),
        None => backend.put_meta(key, value),
    }
}
