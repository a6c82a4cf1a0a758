//! Wiring a configured [`PipelineDriver`] and persisting run metadata.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sc_av::{FfmpegBackend, MediaBackend, ToolRegistry};
use sc_core::config::Config;
use sc_core::{Error, Result, RunSummary};
use sc_pipeline::{build_registry, BindingTable, PipelineDriver, RunSettings};

/// Build a driver backed by ffmpeg.
///
/// Fails with [`Error::Tool`] when ffmpeg or ffprobe cannot be found, and
/// with [`Error::Config`] when a capability definition is unusable.
pub fn build_driver(config: &Config, tools: &ToolRegistry) -> Result<PipelineDriver> {
    let backend: Arc<dyn MediaBackend> = Arc::new(FfmpegBackend::from_registry(tools)?);
    build_driver_with_backend(config, tools, backend)
}

/// Build a driver with an explicit media backend.
pub fn build_driver_with_backend(
    config: &Config,
    tools: &ToolRegistry,
    backend: Arc<dyn MediaBackend>,
) -> Result<PipelineDriver> {
    for warning in config.validate() {
        tracing::warn!("config: {warning}");
    }
    let registry = build_registry(config, tools)?;
    tracing::debug!(
        "registered capabilities: {}",
        registry.names().collect::<Vec<_>>().join(", ")
    );
    let bindings = BindingTable::from_config(config);
    Ok(PipelineDriver::new(
        Arc::new(registry),
        Arc::new(bindings),
        RunSettings::from_config(config),
        backend,
    ))
}

/// Where the metadata for `output` is written (`video.mp4` -> `video.json`).
pub fn summary_path(output: &Path) -> PathBuf {
    output.with_extension("json")
}

/// Write `summary` next to its output file and return the metadata path.
pub fn write_summary(summary: &RunSummary) -> Result<PathBuf> {
    let path = summary_path(&summary.output);
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| Error::Internal(format!("cannot serialize run summary: {e}")))?;
    std::fs::write(&path, json)?;
    Ok(path)
}
