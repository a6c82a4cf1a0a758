//! sc-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other sc-* crates,
//! providing the run and segment data model, the stage enumeration, a
//! unified error type, application configuration, and a broadcast event bus
//! for run progress.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod run;
pub mod segment;
pub mod serde_duration;
pub mod stage;

// Re-export the most commonly used items at the crate root.
pub use error::{CapabilityFailure, Error, FailureKind, Result};
pub use ids::*;
pub use run::*;
pub use segment::*;
pub use stage::Stage;
