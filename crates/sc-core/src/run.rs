//! Run-level records: the inbound request, the mutable [`Run`] owned by the
//! pipeline driver, and the outbound [`RunSummary`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::ids::RunId;
use crate::segment::SegmentStatus;
use crate::stage::Stage;

/// Theme used when the request does not name one.
pub const DEFAULT_THEME: &str = "modern_dark";

/// How deep the narration should go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    /// Short, conversational explanation of each point.
    #[default]
    Standard,
    /// Longer, expert-level explanation.
    Intelligent,
}

/// Presenter face used by the avatar stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarRequest {
    pub face_image: PathBuf,
}

/// Per-run options supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Upper bound on the number of segments kept after understanding.
    pub max_segments: Option<usize>,
    pub theme: String,
    /// `None` skips the avatar stage.
    pub avatar: Option<AvatarRequest>,
    /// Voice selector; falls back to the configured default.
    pub voice: Option<String>,
    pub detail: DetailLevel,
    /// File name of the composed output inside the output directory.
    pub output_name: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_segments: None,
            theme: DEFAULT_THEME.into(),
            avatar: None,
            voice: None,
            detail: DetailLevel::Standard,
            output_name: "video.mp4".into(),
        }
    }
}

/// Inbound generation request. The document is already text-extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Reference to where the document came from (path, upload name, ...).
    pub source: String,
    pub document: String,
    pub provider: String,
    #[serde(default)]
    pub options: RunOptions,
}

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    #[default]
    Pending,
    Running,
    Done,
    Skipped,
    Failed,
}

/// Counts and capability usage recorded for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub state: StageState,
    pub succeeded: usize,
    pub failed: usize,
    /// Capability name -> number of segments it produced.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capabilities_used: BTreeMap<String, usize>,
    /// Segments satisfied by a capability other than the most preferred one.
    #[serde(default)]
    pub fallback_used: usize,
    /// The provider had no binding for this stage; defaults were used.
    #[serde(default)]
    pub resolved_from_defaults: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// Output was produced but some segments were dropped along the way.
    PartiallySucceeded { dropped: usize },
    Failed { stage: Stage, cause: String },
}

/// One end-to-end invocation, mutated only by the pipeline driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub source: String,
    pub provider: String,
    pub options: RunOptions,
    /// Index into [`Stage::ALL`] of the stage currently executing.
    pub current_stage: usize,
    pub stages: BTreeMap<Stage, StageReport>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

impl Run {
    pub fn new(request: &RunRequest) -> Self {
        Self {
            id: RunId::new(),
            source: request.source.clone(),
            provider: request.provider.clone(),
            options: request.options.clone(),
            current_stage: 0,
            stages: Stage::ALL
                .into_iter()
                .map(|s| (s, StageReport::default()))
                .collect(),
            created_at: Utc::now(),
            completed_at: None,
            outcome: None,
        }
    }

    pub fn report(&self, stage: Stage) -> &StageReport {
        &self.stages[&stage]
    }

    pub fn report_mut(&mut self, stage: Stage) -> &mut StageReport {
        self.stages.entry(stage).or_default()
    }

    pub fn begin_stage(&mut self, stage: Stage) {
        self.current_stage = stage.ordinal();
        self.report_mut(stage).state = StageState::Running;
    }

    pub fn skip_stage(&mut self, stage: Stage, reason: impl Into<String>) {
        self.current_stage = stage.ordinal();
        let report = self.report_mut(stage);
        report.state = StageState::Skipped;
        report.cause = Some(reason.into());
    }

    pub fn finish_stage(&mut self, stage: Stage, mut report: StageReport) {
        report.state = StageState::Done;
        self.stages.insert(stage, report);
    }

    /// Mark the run failed, attributing the cause to `stage`.
    pub fn fail(&mut self, stage: Stage, cause: impl Into<String>) {
        let cause = cause.into();
        let report = self.report_mut(stage);
        report.state = StageState::Failed;
        report.cause = Some(cause.clone());
        self.completed_at = Some(Utc::now());
        self.outcome = Some(RunOutcome::Failed { stage, cause });
    }

    /// Mark the run complete; any dropped segment makes it partial.
    pub fn complete(&mut self, dropped: usize) {
        self.completed_at = Some(Utc::now());
        self.outcome = Some(if dropped == 0 {
            RunOutcome::Succeeded
        } else {
            RunOutcome::PartiallySucceeded { dropped }
        });
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Outbound metadata for a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub source: String,
    pub provider: String,
    pub output: PathBuf,
    #[serde(with = "crate::serde_duration")]
    pub total_duration: Duration,
    pub segments: usize,
    pub dropped: usize,
    pub outcome: RunOutcome,
    pub stages: BTreeMap<Stage, StageReport>,
    /// Capabilities actually used, for stages where they differ from the
    /// first preference of the requested provider.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers_used: BTreeMap<Stage, Vec<String>>,
    /// Per-stage status of each composed segment, keyed by segment index.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub segment_status: BTreeMap<u32, BTreeMap<Stage, SegmentStatus>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub processing_secs: f64,
}
