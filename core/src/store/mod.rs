// Store module: persistence for the snode pool and per-account swarms

pub mod backend;
pub mod snode_store;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use snode_store::SnodeStore;
