//! The [`Capability`] trait: one pluggable implementation of a pipeline stage.
//!
//! A capability receives a stage-specific [`CapabilityRequest`] and returns
//! the matching [`CapabilityResponse`] or a [`CapabilityFailure`]. It may
//! perform network I/O or spawn processes, must write artifacts only under
//! [`InvokeContext::stage_dir`], and must be safe to invoke again with the
//! same request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sc_core::{
    AudioArtifact, AvatarArtifact, CapabilityFailure, ContentUnit, DetailLevel, Stage,
    VisualArtifact,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Stage-specific input of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum CapabilityRequest {
    /// Document text to ordered content units.
    Understand {
        document: String,
        max_units: Option<usize>,
    },
    /// One content unit to a slide image.
    Visual {
        unit: ContentUnit,
        index: u32,
        theme: String,
        width: u32,
        height: u32,
    },
    /// One content unit to narration text. `position` counts only the
    /// segments still alive when scripts are generated, out of `total`.
    Script {
        unit: ContentUnit,
        index: u32,
        position: usize,
        total: usize,
        detail: DetailLevel,
    },
    /// Narration text to speech audio.
    Speech {
        script: String,
        voice: Option<String>,
        index: u32,
    },
    /// Speech audio plus a face to a lip-synced video.
    Avatar {
        audio: PathBuf,
        face_image: PathBuf,
        index: u32,
    },
}

impl CapabilityRequest {
    /// The stage this request belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            CapabilityRequest::Understand { .. } => Stage::Understand,
            CapabilityRequest::Visual { .. } => Stage::GenerateVisual,
            CapabilityRequest::Script { .. } => Stage::GenerateScript,
            CapabilityRequest::Speech { .. } => Stage::SynthesizeSpeech,
            CapabilityRequest::Avatar { .. } => Stage::SyncAvatar,
        }
    }

    /// Segment index, for per-segment requests.
    pub fn index(&self) -> Option<u32> {
        match self {
            CapabilityRequest::Understand { .. } => None,
            CapabilityRequest::Visual { index, .. }
            | CapabilityRequest::Script { index, .. }
            | CapabilityRequest::Speech { index, .. }
            | CapabilityRequest::Avatar { index, .. } => Some(*index),
        }
    }

    /// The main text payload, if the request carries one.
    pub fn text(&self) -> Option<String> {
        match self {
            CapabilityRequest::Understand { document, .. } => Some(document.clone()),
            CapabilityRequest::Script { unit, .. } | CapabilityRequest::Visual { unit, .. } => {
                let mut text = unit.title.clone();
                for point in &unit.key_points {
                    text.push('\n');
                    text.push_str(point);
                }
                Some(text)
            }
            CapabilityRequest::Speech { script, .. } => Some(script.clone()),
            CapabilityRequest::Avatar { .. } => None,
        }
    }
}

/// Stage-specific output of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", content = "value", rename_all = "snake_case")]
pub enum CapabilityResponse {
    Outline(Vec<ContentUnit>),
    Visual(VisualArtifact),
    Script(String),
    Speech(AudioArtifact),
    Avatar(AvatarArtifact),
}

impl CapabilityResponse {
    /// The stage this response answers.
    pub fn stage(&self) -> Stage {
        match self {
            CapabilityResponse::Outline(_) => Stage::Understand,
            CapabilityResponse::Visual(_) => Stage::GenerateVisual,
            CapabilityResponse::Script(_) => Stage::GenerateScript,
            CapabilityResponse::Speech(_) => Stage::SynthesizeSpeech,
            CapabilityResponse::Avatar(_) => Stage::SyncAvatar,
        }
    }
}

/// Per-invocation context handed to a capability.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    /// The only directory the capability may write to.
    pub stage_dir: PathBuf,
    /// Deadline for the invocation; exceeding it is a transient failure.
    pub timeout: Duration,
    /// Cancelled when the run is aborted.
    pub cancellation: CancellationToken,
}

impl InvokeContext {
    pub fn new(stage_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            stage_dir: stage_dir.into(),
            timeout,
            cancellation: CancellationToken::new(),
        }
    }

    /// Builder: attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Artifact path for `index` produced by `capability`.
    ///
    /// The capability name keeps a fallback from clobbering a partial file
    /// left by an earlier capability in the chain.
    pub fn artifact_path(&self, index: Option<u32>, capability: &str, ext: &str) -> PathBuf {
        let stem = match index {
            Some(i) => format!("segment_{i:03}"),
            None => "document".to_string(),
        };
        let safe: String = capability
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.stage_dir.join(format!("{stem}.{safe}.{ext}"))
    }

    /// Whether `path` lies inside the stage directory.
    pub fn owns(&self, path: &Path) -> bool {
        path.starts_with(&self.stage_dir)
    }
}

/// A pluggable implementation of one stage.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique name used in bindings and reports.
    fn name(&self) -> &str;

    /// The stage this capability serves.
    fn stage(&self) -> Stage;

    /// Perform one invocation.
    async fn invoke(
        &self,
        request: CapabilityRequest,
        ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure>;
}

impl std::fmt::Debug for dyn Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name())
            .field("stage", &self.stage())
            .finish()
    }
}
