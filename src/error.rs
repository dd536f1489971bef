//! Error types for rhizome_trees

use crate::model::Hash;
use thiserror::Error;

/// Result type alias for rhizome_trees operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in rhizome_trees operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A caller-requested object (commit, branch, blob) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A digest referenced by live data could not be resolved or decoded.
    #[error("Corrupt state: {0}")]
    CorruptState(String),

    #[error("Commit references unknown parent {0}")]
    DanglingParent(Hash),

    #[error("Commit {commit} would create a cycle through parent {parent}")]
    CyclicHistory { commit: Hash, parent: Hash },

    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    /// The branch head moved between read and compare-and-swap; retry with the fresh head.
    #[error("Branch '{name}' was concurrently updated (expected {expected:?}, found {found:?})")]
    ConcurrentBranchUpdate {
        name: String,
        expected: Option<Hash>,
        found: Option<Hash>,
    },

    #[error("Branch '{name}' cannot fast-forward from {from} to {to}")]
    NotFastForward { name: String, from: Hash, to: Hash },

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Invalid branch name: {0:?}")]
    InvalidBranchName(String),

    #[error("Branch '{0}' points at a commit outside the retention set")]
    BranchNotRetained(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Invalid database file: {0}")]
    InvalidFile(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a digest that should exist but does not.
    pub(crate) fn missing(hash: &Hash) -> Self {
        Error::CorruptState(format!("unresolvable digest {}", hash))
    }

    /// Whether a caller may retry the operation as-is with fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentBranchUpdate { .. })
    }
}
