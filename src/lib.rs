//! # rhizome_trees
//!
//! Persistent, content-addressed merkle trees with git-like history.
//!
//! Every tree version is an immutable root digest. Writes copy only the path
//! from the changed leaf to the root and share everything else, so any number
//! of historical versions and branches coexist cheaply. Versions are recorded
//! as commits in a DAG, any key can be proven present or absent against a root
//! without access to the tree, and history that is no longer retained can be
//! pruned without disturbing what is.
//!
//! ## Core Concepts
//!
//! - **Nodes**: immutable blobs addressed by the BLAKE3 digest of their canonical encoding
//! - **Roots**: the digest of a tree's top node (`Hash::ZERO` is the empty tree)
//! - **Commits**: immutable snapshots linking a root to its parent commits
//! - **Branches**: named, compare-and-swap protected pointers to commits
//! - **Proofs**: inclusion/exclusion witnesses verifiable without a store
//! - **Pruning**: mark-and-sweep reclamation of history outside a retention policy
//!
//! ## Example
//!
//! ```ignore
//! use rhizome_trees::{Config, Database};
//!
//! let db = Database::in_memory(Config::default())?;
//! let root = db.write(rhizome_trees::Hash::ZERO, b"x", b"1")?;
//! let commit = db.commit(root, &[], Default::default())?;
//! db.branches().create("main", commit)?;
//! let proof = db.prove(root, b"x")?;
//! assert!(rhizome_trees::verify(&proof, root, b"x", Some(&b"1"[..])));
//! ```

pub mod codec;
pub mod config;
pub mod graph;
pub mod model;
pub mod ops;
pub mod proof;
pub mod prune;
pub mod store;
pub mod trie;
pub mod viz;

mod database;
mod error;

pub use config::{Config, KeyOrdering};
pub use database::{Branches, Database};
pub use error::{Error, Result};
pub use graph::{Ancestors, VersionGraph};
pub use model::{Commit, CommitInfo, Hash};
pub use ops::{diff_trees, BranchTable, Diff, DiffEntry};
pub use proof::{prove, verify, Proof, ProofStep, Terminal};
pub use prune::{CancelToken, PruneReport, Pruner, RetentionPolicy};
pub use store::{Backend, FileBackend, MemoryBackend, NodeStore};
pub use trie::{Change, Entry, MerkleTrie, TrieNode, ValueRef};

/// Canonical encoding format version for nodes, commits and proofs
pub const FORMAT_VERSION: u32 = 1;

/// Database file format version
pub const VERSION: u32 = 1;

/// Magic bytes for file identification
pub const MAGIC: &[u8; 8] = b"RHIZOME\0";
