//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! tool paths, pipeline policy, composition encoding profile, capability
//! definitions, and the provider binding table. Every section defaults
//! sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::stage::Stage;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub pipeline: PipelineConfig,
    pub composition: CompositionConfig,
    /// Capability name -> definition.
    pub capabilities: BTreeMap<String, CapabilityDefinition>,
    /// Provider name -> stage -> ordered capability names.
    pub providers: BTreeMap<String, BTreeMap<Stage, Vec<String>>>,
    /// Stage -> ordered capability names used when a provider has no binding.
    pub defaults: BTreeMap<Stage, Vec<String>>,
    /// Voice selector used when a run does not request one.
    pub voice: Option<String>,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(|e| Error::Config(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    ///
    /// A file that exists but fails to parse is an error: silently running
    /// with different capability bindings than the operator wrote is worse
    /// than refusing to start.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))),
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_concurrency == 0 {
            warnings.push("pipeline.max_concurrency is 0; 1 will be used".into());
        }

        let c = &self.composition;
        if c.width % 2 != 0 || c.height % 2 != 0 {
            warnings.push(format!(
                "composition size {}x{} is odd; yuv420p encoders require even dimensions",
                c.width, c.height
            ));
        }
        if c.fps == 0 {
            warnings.push("composition.fps is 0".into());
        }

        for (name, def) in &self.capabilities {
            if let Some(stage) = def.kind.fixed_stage() {
                if def.stage.is_some_and(|s| s != stage) {
                    warnings.push(format!(
                        "capabilities.{name} is a {} capability and can only serve {stage}",
                        def.kind.kind_name()
                    ));
                }
            } else if def.stage.is_none() {
                warnings.push(format!("capabilities.{name} has no stage"));
            }
        }

        let mut check_names = |origin: String, stage: &Stage, names: &[String]| {
            for name in names {
                match self.capabilities.get(name) {
                    None if !is_builtin_name(name) => {
                        warnings.push(format!("{origin}.{stage} references unknown capability '{name}'"));
                    }
                    Some(def) if def.resolved_stage() != Some(*stage) => {
                        warnings.push(format!(
                            "{origin}.{stage} references '{name}', which serves a different stage"
                        ));
                    }
                    _ => {}
                }
            }
        };

        for (provider, stages) in &self.providers {
            for (stage, names) in stages {
                check_names(format!("providers.{provider}"), stage, names);
            }
        }
        for (stage, names) in &self.defaults {
            check_names("defaults".into(), stage, names);
        }

        warnings
    }
}

/// Names that resolve to built-in capabilities without a definition.
pub const BUILTIN_CAPABILITIES: &[&str] = &["outline", "narration", "title_card"];

fn is_builtin_name(name: &str) -> bool {
    BUILTIN_CAPABILITIES.contains(&name)
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Retry policy applied to every capability invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries of the same capability after a transient failure.
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

/// Pipeline execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum capability invocations in flight within one stage.
    pub max_concurrency: usize,
    pub retry: RetryConfig,
    /// Hard timeout for one capability invocation.
    pub invoke_timeout_secs: u64,
    /// Parent directory for per-run workspaces. Defaults to the system temp dir.
    pub work_dir: Option<PathBuf>,
    /// Directory receiving composed outputs.
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryConfig::default(),
            invoke_timeout_secs: 300,
            work_dir: None,
            output_dir: PathBuf::from("./outputs"),
        }
    }
}

impl PipelineConfig {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// How the avatar clip is placed over the slide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarMode {
    /// Square inset in the bottom-right corner.
    #[default]
    Inset,
    /// The avatar replaces the slide.
    FullFrame,
}

/// Avatar placement settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarLayout {
    pub mode: AvatarMode,
    /// Edge length of the inset, in pixels.
    pub size: u32,
    /// Distance of the inset from the right and bottom edges.
    pub margin: u32,
}

impl Default for AvatarLayout {
    fn default() -> Self {
        Self {
            mode: AvatarMode::Inset,
            size: 300,
            margin: 50,
        }
    }
}

/// Encoding profile shared by every per-segment clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_codec: String,
    pub preset: String,
    pub pix_fmt: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub avatar: AvatarLayout,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 25,
            video_codec: "libx264".into(),
            preset: "fast".into(),
            pix_fmt: "yuv420p".into(),
            audio_codec: "aac".into(),
            audio_bitrate: "192k".into(),
            sample_rate: 48_000,
            channels: 2,
            avatar: AvatarLayout::default(),
        }
    }
}

impl CompositionConfig {
    /// Duration of one frame; the tolerance for timing comparisons.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// A named capability as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDefinition {
    #[serde(flatten)]
    pub kind: CapabilityKind,
    /// Stage served. Required for `command` and `http`; implied otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Overrides `pipeline.invoke_timeout_secs` for this capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CapabilityDefinition {
    /// The stage this capability serves, if it can be determined.
    pub fn resolved_stage(&self) -> Option<Stage> {
        self.kind.fixed_stage().or(self.stage)
    }
}

/// Implementation backing a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Heuristic document splitter.
    Outline {
        #[serde(default = "default_max_key_points")]
        max_key_points: usize,
    },
    /// Template narration built from the slide content.
    Narration,
    /// Themed slide rendered with ffmpeg `drawtext`.
    TitleCard {
        #[serde(default)]
        font_file: Option<PathBuf>,
    },
    /// External program with `{placeholder}` argument templating.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Extension of the artifact the program writes to `{output}`.
        #[serde(default)]
        output_extension: Option<String>,
    },
    /// Remote JSON endpoint.
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

fn default_max_key_points() -> usize {
    7
}

impl CapabilityKind {
    /// Built-in kinds serve exactly one stage.
    pub fn fixed_stage(&self) -> Option<Stage> {
        match self {
            CapabilityKind::Outline { .. } => Some(Stage::Understand),
            CapabilityKind::Narration => Some(Stage::GenerateScript),
            CapabilityKind::TitleCard { .. } => Some(Stage::GenerateVisual),
            CapabilityKind::Command { .. } | CapabilityKind::Http { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            CapabilityKind::Outline { .. } => "outline",
            CapabilityKind::Narration => "narration",
            CapabilityKind::TitleCard { .. } => "title_card",
            CapabilityKind::Command { .. } => "command",
            CapabilityKind::Http { .. } => "http",
        }
    }
}
