pub mod common;
pub mod completions;
pub mod conflicts;
pub mod entities;
pub mod queue;
pub mod status;
pub mod sync;
pub mod wipe;
