//! Git-like operations: branches and diffs

mod branch;
mod diff;

pub use branch::{validate_name, BranchTable};
pub use diff::{diff_trees, Diff, DiffEntry};
