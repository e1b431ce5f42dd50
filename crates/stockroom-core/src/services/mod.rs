//! Shared services used by the sync engine and clients.

mod local_store;

pub use local_store::{keys, tracked_keys, LocalStore};
