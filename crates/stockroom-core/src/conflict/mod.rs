//! Conflict detection, merging and the persisted conflict history

mod detect;
mod merge;
mod resolver;

pub use detect::{deep_equal, detect, resolution_options};
pub use merge::merge_objects;
pub use resolver::ConflictResolver;
pub(crate) use resolver::ensure_allowed;
