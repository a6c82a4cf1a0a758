//! The per-unit-of-content record that stages read and mutate.
//!
//! A [`Segment`] bundles one slide, one script, one audio clip, and an
//! optional avatar clip. Segments are created by the understand stage, which
//! fixes their count and ordinal order; later stages fill in fields in place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::stage::Stage;

/// Difficulty tag attached to a content unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

/// One teachable chunk of the source document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub title: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    /// Suggested diagram style for slide generators that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_hint: Option<String>,
}

impl ContentUnit {
    /// Check that the unit can carry a segment through the pipeline.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("content unit has an empty title".into());
        }
        if self.key_points.iter().all(|p| p.trim().is_empty()) {
            return Err(format!("content unit '{}' has no key points", self.title.trim()));
        }
        Ok(())
    }
}

/// A slide image produced by the visual stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualArtifact {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Narration audio. The duration is the timing master for composition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub path: PathBuf,
    #[serde(with = "crate::serde_duration")]
    pub duration: Duration,
}

/// A lip-synced presenter clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarArtifact {
    pub path: PathBuf,
    #[serde(with = "crate::serde_duration")]
    pub duration: Duration,
}

/// Outcome of one stage for one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SegmentStatus {
    #[default]
    Pending,
    /// The most-preferred capability succeeded (possibly after retries).
    Done { capability: String },
    /// A later capability in the preference order succeeded.
    FallbackUsed {
        capability: String,
        skipped: Vec<String>,
    },
    /// Every capability failed; the segment is dropped if the stage is mandatory.
    Failed { cause: String },
}

impl SegmentStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SegmentStatus::Done { .. } | SegmentStatus::FallbackUsed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SegmentStatus::Failed { .. })
    }

    /// Name of the capability that produced the result, if any.
    pub fn capability(&self) -> Option<&str> {
        match self {
            SegmentStatus::Done { capability } | SegmentStatus::FallbackUsed { capability, .. } => {
                Some(capability)
            }
            _ => None,
        }
    }
}

/// The unit of work carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Ordinal position in the final output. Stable and unique within a run.
    pub index: u32,
    pub unit: ContentUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual: Option<VisualArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<AvatarArtifact>,
    pub status: BTreeMap<Stage, SegmentStatus>,
}

impl Segment {
    /// Create a segment with every capability stage pending.
    pub fn new(index: u32, unit: ContentUnit) -> Self {
        let status = Stage::CAPABILITY_STAGES
            .into_iter()
            .map(|s| (s, SegmentStatus::Pending))
            .collect();
        Self {
            index,
            unit,
            script: None,
            visual: None,
            audio: None,
            avatar: None,
            status,
        }
    }

    pub fn status(&self, stage: Stage) -> &SegmentStatus {
        static PENDING: SegmentStatus = SegmentStatus::Pending;
        self.status.get(&stage).unwrap_or(&PENDING)
    }

    pub fn set_status(&mut self, stage: Stage, status: SegmentStatus) {
        self.status.insert(stage, status);
    }

    /// Whether any mandatory stage marked this segment failed.
    pub fn lost_mandatory_stage(&self) -> Option<Stage> {
        self.status
            .iter()
            .find(|(stage, status)| stage.is_mandatory() && status.is_failed())
            .map(|(stage, _)| *stage)
    }

    /// A segment may enter composition only with a visual and a timed audio.
    pub fn is_composable(&self) -> bool {
        self.visual.is_some()
            && self
                .audio
                .as_ref()
                .is_some_and(|a| !a.duration.is_zero())
    }

    /// Zero-padded stem used for artifact file names (`segment_003`).
    pub fn file_stem(&self) -> String {
        format!("segment_{:03}", self.index)
    }
}
