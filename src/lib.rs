//! Slidecast - turns documents into narrated slide videos.
//!
//! The library crate wires configuration, tool discovery and the capability
//! registry into a [`PipelineDriver`](sc_pipeline::PipelineDriver), and
//! exposes the pieces the binary and the integration tests share.

pub mod app;
pub mod document;

pub use app::{build_driver, summary_path, write_summary};
pub use document::read_document;
