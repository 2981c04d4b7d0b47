//! Persistence for the Parley relay.
//!
//! The relay core records who has logged in from where, who is whose
//! contact, and per-user message counts. [`Storage`] is the seam; the
//! fjall implementation is the one deployments use.

mod fjall_store;
mod memory;
mod store;

pub use fjall_store::FjallStore;
pub use memory::MemoryStore;
pub use store::{LoginRecord, MessageStats, Storage, UserRecord};

/// Errors produced by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage engine error: {0}")]
    Engine(#[from] fjall::Error),

    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}
