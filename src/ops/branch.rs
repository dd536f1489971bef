//! Branch table: named, mutable pointers to commits

use crate::graph::VersionGraph;
use crate::model::Hash;
use crate::store::{CasOutcome, NodeStore};
use crate::{Error, Result};
use tracing::debug;

const REF_PREFIX: &str = "ref/";

/// Manages branches
///
/// Branch heads are the only mutable state in the engine. Every change to a
/// head goes through a single compare-and-swap on the backend's meta table,
/// so concurrent writers cannot lose each other's updates: the loser gets
/// [`Error::ConcurrentBranchUpdate`] and retries against the new head.
pub struct BranchTable<'a> {
    store: &'a NodeStore,
}

impl<'a> BranchTable<'a> {
    pub fn new(store: &'a NodeStore) -> Self {
        BranchTable { store }
    }

    /// Create a branch pointing at an existing commit
    pub fn create(&self, name: &str, commit: Hash) -> Result<()> {
        validate_name(name)?;
        self.require_commit(&commit)?;

        match self.swap(name, None, Some(commit))? {
            CasOutcome::Swapped => {
                debug!(branch = name, commit = %commit.short(), "Created branch");
                Ok(())
            }
            CasOutcome::Conflict(_) => Err(Error::BranchExists(name.to_string())),
        }
    }

    /// Get the commit at a branch, `None` if there is no such branch
    pub fn get(&self, name: &str) -> Result<Option<Hash>> {
        validate_name(name)?;
        match self.store.backend().get_meta(&ref_key(name))? {
            Some(bytes) => Ok(Some(decode_head(name, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Get the commit at a branch, failing if it does not exist
    pub fn head(&self, name: &str) -> Result<Hash> {
        self.get(name)?
            .ok_or_else(|| Error::NotFound(format!("branch {}", name)))
    }

    /// List all branches, sorted by name
    pub fn list(&self) -> Result<Vec<(String, Hash)>> {
        let backend = self.store.backend();
        let mut branches = Vec::new();
        for key in backend.meta_keys(REF_PREFIX)? {
            let name = &key[REF_PREFIX.len()..];
            // removed between listing and reading
            let Some(bytes) = backend.get_meta(&key)? else {
                continue;
            };
            branches.push((name.to_string(), decode_head(name, &bytes)?));
        }
        Ok(branches)
    }

    /// Delete a branch. The commits it pointed at are untouched.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.store.backend().delete_meta(&ref_key(name))? {
            debug!(branch = name, "Deleted branch");
            Ok(())
        } else {
            Err(Error::NotFound(format!("branch {}", name)))
        }
    }

    /// Fast-forward a branch to `new`, returning the previous head
    ///
    /// `new` must descend from the current head (a merge commit with the
    /// head as a parent qualifies). The move is a compare-and-swap against
    /// the head observed at the start, so a concurrent move in between is
    /// reported rather than overwritten.
    pub fn advance(&self, name: &str, new: Hash) -> Result<Hash> {
        let current = self.head(name)?;
        if current == new {
            return Ok(current);
        }
        self.require_commit(&new)?;

        let graph = VersionGraph::new(self.store);
        if !graph.is_ancestor(&current, &new)? {
            return Err(Error::NotFastForward {
                name: name.to_string(),
                from: current,
                to: new,
            });
        }

        self.compare_and_swap(name, Some(current), Some(new))?;
        Ok(current)
    }

    /// Raw compare-and-swap of a branch head
    ///
    /// `expected == None` requires the branch to be absent; `new == None`
    /// deletes it. No ancestry check is made.
    pub fn compare_and_swap(&self, name: &str, expected: Option<Hash>, new: Option<Hash>) -> Result<()> {
        validate_name(name)?;
        if let Some(commit) = &new {
            self.require_commit(commit)?;
        }

        match self.swap(name, expected, new)? {
            CasOutcome::Swapped => {
                debug!(branch = name, from = ?expected, to = ?new, "Moved branch");
                Ok(())
            }
            CasOutcome::Conflict(found) => Err(Error::ConcurrentBranchUpdate {
                name: name.to_string(),
                expected,
                found: found.map(|bytes| decode_head(name, &bytes)).transpose()?,
            }),
        }
    }

    fn swap(&self, name: &str, expected: Option<Hash>, new: Option<Hash>) -> Result<CasOutcome> {
        self.store.backend().compare_and_swap_meta(
            &ref_key(name),
            expected.as_ref().map(|h| h.as_bytes().as_slice()),
            new.as_ref().map(|h| h.as_bytes().as_slice()),
        )
    }

    fn require_commit(&self, commit: &Hash) -> Result<()> {
        if VersionGraph::new(self.store).contains(commit)? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("commit {}", commit)))
        }
    }
}

/// Branch names: non-empty, no whitespace, not starting with `/`
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('/') || name.chars().any(char::is_whitespace) {
        return Err(Error::InvalidBranchName(name.to_string()));
    }
    Ok(())
}

fn ref_key(name: &str) -> String {
    format!("{}{}", REF_PREFIX, name)
}

fn decode_head(name: &str, bytes: &[u8]) -> Result<Hash> {
    Hash::from_slice(bytes)
        .ok_or_else(|| Error::CorruptState(format!("Branch '{}' holds a malformed head", name)))
}
