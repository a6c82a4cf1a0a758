//! Composition engine: per-segment clips joined into one output file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sc_core::config::CompositionConfig;
use sc_core::{Error, Segment, Stage};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::backend::MediaBackend;
use super::plan::ClipSpec;
use crate::probe::ClipParams;

/// Which concatenation path produced the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcatPath {
    /// Stream copy, no re-encode.
    FastCopy,
    /// Normalize and re-encode every clip.
    Reencode,
}

/// One rendered segment clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedClip {
    pub index: u32,
    pub path: PathBuf,
    #[serde(with = "sc_core::serde_duration")]
    pub duration: Duration,
}

/// The composed output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedOutput {
    pub path: PathBuf,
    /// Sum of the segment audio durations.
    #[serde(with = "sc_core::serde_duration")]
    pub expected_duration: Duration,
    #[serde(with = "sc_core::serde_duration")]
    pub measured_duration: Duration,
    pub path_taken: ConcatPath,
    /// Clips in playback order.
    pub clips: Vec<RenderedClip>,
    /// Segments whose clip failed to render and were left out.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lost: Vec<u32>,
}

/// Assembles segments into one output with uniform encoding.
pub struct CompositionEngine {
    backend: Arc<dyn MediaBackend>,
    profile: CompositionConfig,
}

impl CompositionEngine {
    pub fn new(backend: Arc<dyn MediaBackend>, profile: CompositionConfig) -> Self {
        Self { backend, profile }
    }

    pub fn profile(&self) -> &CompositionConfig {
        &self.profile
    }

    /// Render one clip per segment into `work_dir` and join them at `output`.
    ///
    /// Segments are composed in ascending index order. A segment whose clip
    /// fails to render is left out and listed in [`ComposedOutput::lost`];
    /// if no clip renders the stage is exhausted. The fast path is taken
    /// only when every clip reports the same parameters; a fast-path error
    /// or a duration off by more than one frame per clip falls back to the
    /// re-encode path. Failure of both is [`Error::Composition`].
    pub async fn compose(
        &self,
        segments: &[Segment],
        work_dir: &Path,
        output: &Path,
        cancellation: &CancellationToken,
    ) -> sc_core::Result<ComposedOutput> {
        if segments.is_empty() {
            return Err(Error::exhausted(Stage::Compose, "no segments to compose"));
        }

        let mut ordered: Vec<&Segment> = segments.iter().collect();
        ordered.sort_by_key(|s| s.index);
        if let Some(dup) = ordered.windows(2).find(|w| w[0].index == w[1].index) {
            return Err(Error::Internal(format!(
                "duplicate segment index {}",
                dup[0].index
            )));
        }

        let frame = self.profile.frame_duration();
        let specs = ordered
            .iter()
            .map(|seg| ClipSpec::for_segment(seg, work_dir, frame))
            .collect::<sc_core::Result<Vec<_>>>()?;

        let mut clips = Vec::with_capacity(specs.len());
        let mut lost = Vec::new();
        let mut causes = Vec::new();
        for spec in &specs {
            match guard(cancellation, self.backend.render_clip(spec, &self.profile)).await {
                Ok(()) => clips.push(RenderedClip {
                    index: spec.index,
                    path: spec.output.clone(),
                    duration: spec.duration,
                }),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    let loss = Error::SegmentLoss {
                        stage: Stage::Compose,
                        index: spec.index,
                        cause: e.to_string(),
                    };
                    tracing::warn!("{loss}");
                    causes.push(loss.to_string());
                    lost.push(spec.index);
                }
            }
        }
        if clips.is_empty() {
            return Err(Error::exhausted(Stage::Compose, causes.join("; ")));
        }

        let expected: Duration = clips.iter().map(|c| c.duration).sum();
        let tolerance = frame * clips.len() as u32;
        let paths: Vec<PathBuf> = clips.iter().map(|c| c.path.clone()).collect();

        let fast_error = match self.check_uniform(&clips, cancellation).await? {
            Some(mismatch) => {
                tracing::warn!("{mismatch}; using re-encode concatenation");
                mismatch.to_string()
            }
            None => {
                match self
                    .attempt(ConcatPath::FastCopy, &paths, output, expected, tolerance, cancellation)
                    .await
                {
                    Ok(measured) => {
                        return Ok(self.finish(output, expected, measured, ConcatPath::FastCopy, clips, lost));
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        tracing::warn!("fast concatenation failed: {e}; falling back to re-encode");
                        e.to_string()
                    }
                }
            }
        };

        let _ = tokio::fs::remove_file(output).await;
        match self
            .attempt(ConcatPath::Reencode, &paths, output, expected, tolerance, cancellation)
            .await
        {
            Ok(measured) => Ok(self.finish(output, expected, measured, ConcatPath::Reencode, clips, lost)),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => Err(Error::Composition {
                fast: fast_error,
                fallback: e.to_string(),
            }),
        }
    }

    /// Compare every clip's parameters with the first one.
    ///
    /// Returns the first divergence as a [`Error::CompositionMismatch`]. A
    /// clip that cannot be probed counts as divergent.
    async fn check_uniform(
        &self,
        clips: &[RenderedClip],
        cancellation: &CancellationToken,
    ) -> sc_core::Result<Option<Error>> {
        let mut reference: Option<ClipParams> = None;
        for clip in clips {
            let params = match guard(cancellation, self.backend.probe_clip(&clip.path)).await {
                Ok(p) => p,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    return Ok(Some(Error::CompositionMismatch {
                        index: clip.index,
                        expected: "probeable clip".into(),
                        found: e.to_string(),
                    }))
                }
            };
            match &reference {
                None => reference = Some(params),
                Some(first) => {
                    if first.mismatch(&params).is_some() {
                        return Ok(Some(Error::CompositionMismatch {
                            index: clip.index,
                            expected: first.to_string(),
                            found: params.to_string(),
                        }));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Run one concatenation path and verify the result's duration.
    async fn attempt(
        &self,
        path: ConcatPath,
        clips: &[PathBuf],
        output: &Path,
        expected: Duration,
        tolerance: Duration,
        cancellation: &CancellationToken,
    ) -> sc_core::Result<Duration> {
        let join = async {
            match path {
                ConcatPath::FastCopy => self.backend.concat_copy(clips, output).await,
                ConcatPath::Reencode => {
                    self.backend
                        .concat_reencode(clips, &self.profile, output)
                        .await
                }
            }
        };
        guard(cancellation, join).await?;

        let measured = guard(cancellation, self.backend.probe_duration(output)).await?;
        let deviation = if measured > expected {
            measured - expected
        } else {
            expected - measured
        };
        if deviation > tolerance {
            return Err(Error::Probe(format!(
                "output duration {:.3}s deviates from expected {:.3}s",
                measured.as_secs_f64(),
                expected.as_secs_f64()
            )));
        }
        Ok(measured)
    }

    fn finish(
        &self,
        output: &Path,
        expected: Duration,
        measured: Duration,
        path_taken: ConcatPath,
        clips: Vec<RenderedClip>,
        lost: Vec<u32>,
    ) -> ComposedOutput {
        tracing::info!(
            "composed {} clips via {:?} ({:.2}s)",
            clips.len(),
            path_taken,
            measured.as_secs_f64()
        );
        ComposedOutput {
            path: output.to_path_buf(),
            expected_duration: expected,
            measured_duration: measured,
            path_taken,
            clips,
            lost,
        }
    }
}

/// Race `fut` against cancellation. Dropping the future kills any child.
async fn guard<T>(
    cancellation: &CancellationToken,
    fut: impl std::future::Future<Output = sc_core::Result<T>>,
) -> sc_core::Result<T> {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}
