//! stockroom-core - Core library for Stockroom
//!
//! This crate contains the entity model, the local persistence store, the
//! pending operation queue, conflict detection and resolution, and the sync
//! engine used by every Stockroom interface.

pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{Conflict, ConflictId, Entity, EntityKind, PendingOperation, ResolutionStrategy};
pub use state::{ConnectionStatus, SyncStatus};
pub use sync::{SyncEngine, SyncOutcome, SyncReport};
