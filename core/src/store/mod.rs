// Store module: key/value backends and the persisted proxy state

pub mod backend;
pub mod state;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StoreError};
pub use state::{PersistedState, StateStore};
