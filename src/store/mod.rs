//! Content-addressed object store
//!
//! [`NodeStore`] computes digests and (de)compresses blobs; a [`Backend`]
//! just keeps bytes by digest plus a small meta table. Backends: in-memory
//! and a single append-only file.

mod backend;
mod blob;
mod file_store;
mod memory;
mod node_store;

pub use backend::{Backend, CasOutcome};
pub use blob::{stored_type, Blob, BlobType};
pub use file_store::FileBackend;
pub use memory::MemoryBackend;
pub use node_store::NodeStore;
