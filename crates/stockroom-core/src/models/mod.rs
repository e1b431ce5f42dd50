//! Data models for Stockroom

mod conflict;
mod entity;
mod operation;

pub use conflict::{
    Conflict, ConflictHistory, ConflictId, ConflictType, ResolutionStrategy,
    HISTORY_SCHEMA_VERSION,
};
pub use entity::{
    is_volatile, validate_patch, Customer, Entity, EntityKind, Meter, Product, Record, Row, Sale,
    VOLATILE_FIELDS,
};
pub use operation::{OperationId, OperationKind, PendingOperation, WriteGuard};
