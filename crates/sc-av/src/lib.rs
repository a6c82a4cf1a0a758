//! # sc-av
//!
//! Media tooling for the slidecast pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout and
//!   cancellation support; children never outlive their invocation.
//! - **Run workspaces** ([`RunWorkspace`]) -- per-run directory with one
//!   subdirectory per stage, removed on drop.
//! - **Probing** ([`probe`]) -- durations and stream parameters via ffprobe.
//! - **Visual normalization** ([`normalize_visual`]) -- bring slide images to
//!   the output resolution.
//! - **Composition** ([`compose`]) -- per-segment clips joined into the final
//!   video with a stream-copy fast path and a re-encode fallback.

pub mod command;
pub mod compose;
pub mod probe;
pub mod tools;
pub mod visual;
pub mod workspace;

// ---- Re-exports for convenience ----

pub use command::{CommandError, ToolCommand, ToolOutput};
pub use compose::{
    ComposedOutput, CompositionEngine, ConcatPath, FfmpegBackend, MediaBackend,
};
pub use probe::{probe_media, ClipParams, MediaProbe};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use visual::{normalize_visual, visual_artifact};
pub use workspace::RunWorkspace;
