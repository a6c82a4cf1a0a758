//! # sc-pipeline
//!
//! Orchestration of document-to-video runs.
//!
//! This crate provides:
//!
//! - **[`Capability`]** trait -- one pluggable implementation of a stage,
//!   invoked with a [`CapabilityRequest`] inside an [`InvokeContext`].
//! - **Routing** ([`CapabilityRegistry`], [`BindingTable`], [`ProviderRouter`])
//!   -- resolve a provider name to an ordered fallback chain per stage.
//! - **[`StageExecutor`]** -- bounded fan-out over segments with retry,
//!   deadlines and fallback along the chain.
//! - **[`PipelineDriver`]** -- owns a run, sequences the stages, drops lost
//!   segments and hands the survivors to composition.
//! - **Built-in capabilities** ([`capabilities`]) -- outline, narration,
//!   title cards, plus generic command and HTTP adapters.
//! - **[`build_registry`]** -- builds the registry from configuration.

pub mod capabilities;
pub mod capability;
pub mod context;
pub mod driver;
pub mod executor;
pub mod factory;
pub mod router;

// Re-export key types at the crate root.
pub use capability::{Capability, CapabilityRequest, CapabilityResponse, InvokeContext};
pub use context::{RunSettings, StageContext};
pub use driver::PipelineDriver;
pub use executor::{StageExecutor, StageOutcome};
pub use factory::build_registry;
pub use router::{BindingTable, CapabilityRegistry, ProviderRouter, Routes, StageRoute};
