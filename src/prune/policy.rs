//! Retention policy and prune bookkeeping types

use crate::model::Hash;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a prune must keep
///
/// The retention set is `commits` plus the heads of `branches` (or of every
/// branch with `all_branches`). Ancestors of the retention set are kept too,
/// optionally limited to `max_depth` parent hops and to commits whose
/// logical timestamp is at least `min_timestamp`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub commits: Vec<Hash>,
    pub branches: Vec<String>,
    pub all_branches: bool,
    pub max_depth: Option<usize>,
    pub min_timestamp: Option<u64>,
}

impl RetentionPolicy {
    pub fn commits(commits: impl IntoIterator<Item = Hash>) -> Self {
        RetentionPolicy {
            commits: commits.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn branches<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        RetentionPolicy {
            branches: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_all_branches(mut self) -> Self {
        self.all_branches = true;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn with_min_timestamp(mut self, timestamp: u64) -> Self {
        self.min_timestamp = Some(timestamp);
        self
    }
}

/// Outcome of a prune
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed_nodes: usize,
    pub removed_values: usize,
    pub removed_commits: usize,
    pub live_nodes: usize,
    pub live_commits: usize,
    /// The sweep stopped early; some unreachable blobs remain
    pub cancelled: bool,
}

impl PruneReport {
    pub fn removed_total(&self) -> usize {
        self.removed_nodes + self.removed_values + self.removed_commits
    }
}

/// Cooperative cancellation flag shared with a running prune
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
