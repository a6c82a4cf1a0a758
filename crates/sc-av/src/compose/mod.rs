//! The composition engine.
//!
//! Turns the surviving segments of a run into one output file: one clip per
//! segment, timed by its audio, encoded with a uniform profile, then joined
//! by stream copy or, when clips diverge, by a normalizing re-encode.

mod backend;
mod engine;
mod plan;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{FfmpegBackend, MediaBackend};
pub use engine::{ComposedOutput, CompositionEngine, ConcatPath, RenderedClip};
pub use plan::{plan_avatar, AvatarFit, AvatarInput, ClipSpec};
