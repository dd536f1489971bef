//! Commit history: a DAG of immutable snapshots

mod version;

pub use version::{Ancestors, VersionGraph};
