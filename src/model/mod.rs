//! Core data model types for rhizome_trees

mod commit;
mod hash;

pub use commit::{Commit, CommitInfo};
pub use hash::Hash;
