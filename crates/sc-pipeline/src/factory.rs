//! Capability factory: build the [`CapabilityRegistry`] from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use sc_av::ToolRegistry;
use sc_core::config::{CapabilityKind, Config};
use sc_core::Error;

use crate::capabilities::{
    CommandCapability, HttpCapability, NarrationCapability, OutlineCapability,
    TitleCardCapability,
};
use crate::capability::Capability;
use crate::router::CapabilityRegistry;

/// Key points kept per unit by the built-in outline.
const DEFAULT_MAX_KEY_POINTS: usize = 7;

/// Create every configured capability plus the built-ins.
///
/// A configured capability may reuse a built-in name to replace it.
///
/// # Errors
///
/// Returns [`Error::Config`] if a `command` or `http` capability has no
/// stage.
pub fn build_registry(config: &Config, tools: &ToolRegistry) -> sc_core::Result<CapabilityRegistry> {
    let ffmpeg = tool_path(tools, "ffmpeg");
    let ffprobe = tools.require("ffprobe").ok().map(|t| t.path.clone());
    let mut registry = CapabilityRegistry::new();

    for (name, def) in &config.capabilities {
        let stage = def
            .resolved_stage()
            .ok_or_else(|| Error::Config(format!("capability '{name}' has no stage")))?;

        let capability: Arc<dyn Capability> = match &def.kind {
            CapabilityKind::Outline { max_key_points } => {
                Arc::new(OutlineCapability::new(name, *max_key_points))
            }
            CapabilityKind::Narration => Arc::new(NarrationCapability::new(name)),
            CapabilityKind::TitleCard { font_file } => Arc::new(TitleCardCapability::new(
                name,
                ffmpeg.clone(),
                font_file.clone(),
            )),
            CapabilityKind::Command {
                program,
                args,
                output_extension,
            } => Arc::new(
                CommandCapability::new(name, stage, program, args.clone())
                    .with_output_extension(output_extension.clone())
                    .with_ffprobe(ffprobe.clone()),
            ),
            CapabilityKind::Http { url, headers } => Arc::new(
                HttpCapability::new(name, stage, url)
                    .with_headers(headers.clone())
                    .with_ffprobe(ffprobe.clone()),
            ),
        };
        tracing::debug!("registered {} capability '{name}' for {stage}", def.kind.kind_name());
        registry.register(capability)?;
    }

    let builtins: [Arc<dyn Capability>; 3] = [
        Arc::new(OutlineCapability::new("outline", DEFAULT_MAX_KEY_POINTS)),
        Arc::new(NarrationCapability::new("narration")),
        Arc::new(TitleCardCapability::new("title_card", ffmpeg, None)),
    ];
    for capability in builtins {
        if registry.get(capability.name()).is_none() {
            registry.register(capability)?;
        }
    }

    Ok(registry)
}

/// Discovered path of `name`, or the bare name so the failure surfaces at
/// invocation time.
fn tool_path(tools: &ToolRegistry, name: &str) -> PathBuf {
    match tools.require(name) {
        Ok(tool) => tool.path.clone(),
        Err(_) => {
            tracing::warn!("{name} not found; capabilities that need it will fail");
            PathBuf::from(name)
        }
    }
}
