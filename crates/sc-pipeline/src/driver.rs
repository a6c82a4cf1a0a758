//! Pipeline driver: owns a [`Run`] and sequences the stages.
//!
//! Stages run strictly in [`Stage::ALL`] order; within a stage the executor
//! fans out over segments. Provider routes are resolved once at run start.
//! The run workspace is removed when `execute` returns, on every path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use sc_av::{ComposedOutput, CompositionEngine, ConcatPath, MediaBackend, RunWorkspace};
use sc_core::events::{EventBus, EventPayload};
use sc_core::run::StageReport;
use sc_core::{Error, Run, RunRequest, RunSummary, Segment, Stage};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::capability::CapabilityRequest;
use crate::context::{RunSettings, StageContext};
use crate::executor::{StageExecutor, StageOutcome};
use crate::router::{BindingTable, CapabilityRegistry, ProviderRouter, Routes};

/// Runs documents through every stage to a composed video.
pub struct PipelineDriver {
    router: ProviderRouter,
    settings: Arc<RunSettings>,
    engine: CompositionEngine,
    executor: StageExecutor,
}

impl PipelineDriver {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        bindings: Arc<BindingTable>,
        settings: RunSettings,
        backend: Arc<dyn MediaBackend>,
    ) -> Self {
        let engine = CompositionEngine::new(backend, settings.composition.clone());
        Self {
            router: ProviderRouter::new(registry, bindings),
            settings: Arc::new(settings),
            engine,
            executor: StageExecutor::new(),
        }
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Execute one run to completion.
    ///
    /// # Errors
    ///
    /// Returns the run-fatal error that stopped the run: ingest validation,
    /// stage exhaustion, composition failure or cancellation. Segment-level
    /// failures are absorbed and reported in the summary.
    pub async fn execute(
        &self,
        request: RunRequest,
        cancellation: CancellationToken,
        events: &EventBus,
    ) -> sc_core::Result<RunSummary> {
        let mut run = Run::new(&request);
        let run_id = run.id;
        let span = tracing::info_span!("run", run_id = %run_id);

        async {
            tracing::info!("run started: source={} provider={}", request.source, request.provider);
            events.publish(EventPayload::RunStarted {
                run_id,
                provider: request.provider.clone(),
            });

            match self.run_stages(&mut run, &request, &cancellation, events).await {
                Ok(summary) => {
                    tracing::info!(
                        "run finished: {} segment(s), {} dropped, {:.1}s of video at {}",
                        summary.segments,
                        summary.dropped,
                        summary.total_duration.as_secs_f64(),
                        summary.output.display()
                    );
                    events.publish(EventPayload::RunCompleted {
                        run_id,
                        output: summary.output.clone(),
                        duration_secs: summary.total_duration.as_secs_f64(),
                    });
                    Ok(summary)
                }
                Err(e) => {
                    let stage = e.stage().unwrap_or(Stage::ALL[run.current_stage]);
                    tracing::error!("run failed at {stage}: {e}");
                    run.fail(stage, e.to_string());
                    events.publish(EventPayload::StageFailed {
                        run_id,
                        stage,
                        error: e.to_string(),
                    });
                    events.publish(EventPayload::RunFailed {
                        run_id,
                        stage: Some(stage),
                        error: e.to_string(),
                    });
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        run: &mut Run,
        request: &RunRequest,
        cancellation: &CancellationToken,
        events: &EventBus,
    ) -> sc_core::Result<RunSummary> {
        let workspace = RunWorkspace::create(&self.settings.work_root, &run.id)?;
        let routes = self.router.resolve(&request.provider);
        for line in routes.describe() {
            tracing::debug!("route {line}");
        }

        // -- ingest -----------------------------------------------------------
        check_cancelled(cancellation)?;
        self.begin(run, Stage::Ingest, 0, events);
        let document = ingest(request)?;
        tokio::fs::write(workspace.stage_file(Stage::Ingest, "document.txt"), &document).await?;
        self.finish(
            run,
            Stage::Ingest,
            StageReport {
                succeeded: 1,
                ..Default::default()
            },
            events,
        );

        // -- understand -------------------------------------------------------
        check_cancelled(cancellation)?;
        self.begin(run, Stage::Understand, 0, events);
        let ctx = self.stage_context(Stage::Understand, &workspace, cancellation);
        let (mut segments, report) = self
            .understand(&routes, &document, request.options.max_segments, &ctx)
            .instrument(tracing::info_span!("stage", stage = %Stage::Understand))
            .await?;
        // Units rejected at understand count as lost segments.
        let mut dropped = report.failed;
        self.finish(run, Stage::Understand, report, events);

        // -- per-segment mandatory stages ---------------------------------------
        let width = self.settings.composition.width;
        let height = self.settings.composition.height;
        let theme = request.options.theme.clone();
        let detail = request.options.detail;
        let voice = request
            .options
            .voice
            .clone()
            .or_else(|| self.settings.default_voice.clone());

        let outcome = self
            .segment_stage(run, Stage::GenerateVisual, &routes, &mut segments, &workspace, cancellation, events, |seg| {
                Some(CapabilityRequest::Visual {
                    unit: seg.unit.clone(),
                    index: seg.index,
                    theme: theme.clone(),
                    width,
                    height,
                })
            })
            .await?;
        dropped += drop_lost(&mut segments, Stage::GenerateVisual);
        tracing::debug!("{} visual(s) ready", outcome.succeeded);

        let total = segments.len();
        let positions: HashMap<u32, usize> = segments
            .iter()
            .enumerate()
            .map(|(position, seg)| (seg.index, position))
            .collect();
        self.segment_stage(run, Stage::GenerateScript, &routes, &mut segments, &workspace, cancellation, events, |seg| {
            Some(CapabilityRequest::Script {
                unit: seg.unit.clone(),
                index: seg.index,
                position: positions.get(&seg.index).copied().unwrap_or_default(),
                total,
                detail,
            })
        })
        .await?;
        dropped += drop_lost(&mut segments, Stage::GenerateScript);

        self.segment_stage(run, Stage::SynthesizeSpeech, &routes, &mut segments, &workspace, cancellation, events, |seg| {
            seg.script.as_ref().map(|script| CapabilityRequest::Speech {
                script: script.clone(),
                voice: voice.clone(),
                index: seg.index,
            })
        })
        .await?;
        dropped += drop_lost(&mut segments, Stage::SynthesizeSpeech);

        // -- avatar (optional) ------------------------------------------------
        match avatar_skip_reason(request, &routes) {
            Some(reason) => {
                tracing::info!("skipping {}: {reason}", Stage::SyncAvatar);
                run.skip_stage(Stage::SyncAvatar, reason.clone());
                events.publish(EventPayload::StageSkipped {
                    run_id: run.id,
                    stage: Stage::SyncAvatar,
                    reason,
                });
            }
            None => {
                let face = request
                    .options
                    .avatar
                    .as_ref()
                    .map(|a| a.face_image.clone())
                    .unwrap_or_default();
                self.segment_stage(run, Stage::SyncAvatar, &routes, &mut segments, &workspace, cancellation, events, |seg| {
                    seg.audio.as_ref().map(|audio| CapabilityRequest::Avatar {
                        audio: audio.path.clone(),
                        face_image: face.clone(),
                        index: seg.index,
                    })
                })
                .await?;
            }
        }

        // -- compose ----------------------------------------------------------
        check_cancelled(cancellation)?;
        self.begin(run, Stage::Compose, segments.len(), events);
        let composed = self
            .compose(&segments, &workspace, &request.options.output_name, cancellation)
            .instrument(tracing::info_span!("stage", stage = %Stage::Compose))
            .await?;
        dropped += composed.lost.len();
        segments.retain(|s| !composed.lost.contains(&s.index));
        let mut report = StageReport {
            succeeded: composed.clips.len(),
            failed: composed.lost.len(),
            ..Default::default()
        };
        let label = match composed.path_taken {
            ConcatPath::FastCopy => "fast_copy",
            ConcatPath::Reencode => "reencode",
        };
        report.capabilities_used.insert(label.to_string(), composed.clips.len());
        let output = workspace.persist_output(
            &composed.path,
            &self.settings.output_dir.join(&request.options.output_name),
        )?;
        self.finish(run, Stage::Compose, report, events);

        run.complete(dropped);
        Ok(summarize(run, &routes, output, &composed, &segments, dropped))
    }

    async fn understand(
        &self,
        routes: &Routes,
        document: &str,
        max_segments: Option<usize>,
        ctx: &StageContext,
    ) -> sc_core::Result<(Vec<Segment>, StageReport)> {
        let route = routes
            .route(Stage::Understand)
            .ok_or_else(|| Error::Internal("no route for understand".into()))?;
        let (mut units, outcome) = self
            .executor
            .run_outline(route, document, max_segments, ctx)
            .await?;

        if let Some(max) = max_segments {
            units.truncate(max);
        }

        let mut segments = Vec::with_capacity(units.len());
        let mut invalid = 0;
        for (position, unit) in units.into_iter().enumerate() {
            let index = position as u32;
            match unit.validate() {
                Ok(()) => segments.push(Segment::new(index, unit)),
                Err(cause) => {
                    tracing::warn!(
                        "{}",
                        Error::SegmentLoss {
                            stage: Stage::Understand,
                            index,
                            cause,
                        }
                    );
                    invalid += 1;
                }
            }
        }

        if segments.is_empty() {
            return Err(Error::exhausted(Stage::Understand, "no valid content units"));
        }
        tracing::info!("{} content unit(s), {invalid} rejected", segments.len());

        let mut report = outcome.into_report();
        report.succeeded = segments.len();
        report.failed = invalid;
        Ok((segments, report))
    }

    #[allow(clippy::too_many_arguments)]
    async fn segment_stage<F>(
        &self,
        run: &mut Run,
        stage: Stage,
        routes: &Routes,
        segments: &mut [Segment],
        workspace: &RunWorkspace,
        cancellation: &CancellationToken,
        events: &EventBus,
        build: F,
    ) -> sc_core::Result<StageOutcome>
    where
        F: Fn(&Segment) -> Option<CapabilityRequest>,
    {
        check_cancelled(cancellation)?;
        self.begin(run, stage, segments.len(), events);

        let route = routes
            .route(stage)
            .ok_or_else(|| Error::Internal(format!("no route for {stage}")))?;
        let ctx = self.stage_context(stage, workspace, cancellation);
        let outcome = self
            .executor
            .run(route, segments, &ctx, build)
            .instrument(tracing::info_span!("stage", stage = %stage))
            .await?;

        self.finish(run, stage, outcome.clone().into_report(), events);
        Ok(outcome)
    }

    async fn compose(
        &self,
        segments: &[Segment],
        workspace: &RunWorkspace,
        output_name: &str,
        cancellation: &CancellationToken,
    ) -> sc_core::Result<ComposedOutput> {
        let composable: Vec<Segment> = segments
            .iter()
            .filter(|s| {
                let ok = s.is_composable();
                if !ok {
                    tracing::warn!("segment {} is missing media and is left out", s.index);
                }
                ok
            })
            .cloned()
            .collect();

        let dir = workspace.stage_dir(Stage::Compose);
        let produced = dir.join(output_name);
        let composed = self
            .engine
            .compose(&composable, &dir, &produced, cancellation)
            .await?;
        tracing::info!(
            "composed {} clip(s) via {:?}: expected {:.2}s, measured {:.2}s",
            composed.clips.len(),
            composed.path_taken,
            composed.expected_duration.as_secs_f64(),
            composed.measured_duration.as_secs_f64()
        );
        Ok(composed)
    }

    fn stage_context(
        &self,
        stage: Stage,
        workspace: &RunWorkspace,
        cancellation: &CancellationToken,
    ) -> StageContext {
        StageContext::new(stage, workspace.stage_dir(stage), Arc::clone(&self.settings))
            .with_cancellation(cancellation.clone())
    }

    fn begin(&self, run: &mut Run, stage: Stage, segments: usize, events: &EventBus) {
        tracing::info!("stage {stage} started ({segments} segment(s))");
        run.begin_stage(stage);
        events.publish(EventPayload::StageStarted {
            run_id: run.id,
            stage,
            segments,
        });
    }

    fn finish(&self, run: &mut Run, stage: Stage, report: StageReport, events: &EventBus) {
        tracing::info!(
            "stage {stage} done: {} succeeded, {} failed",
            report.succeeded,
            report.failed
        );
        events.publish(EventPayload::StageCompleted {
            run_id: run.id,
            stage,
            succeeded: report.succeeded,
            failed: report.failed,
        });
        run.finish_stage(stage, report);
    }
}

impl std::fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("router", &self.router)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn check_cancelled(token: &CancellationToken) -> sc_core::Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Normalize line endings and trailing whitespace; reject empty documents.
fn ingest(request: &RunRequest) -> sc_core::Result<String> {
    if request.options.max_segments == Some(0) {
        return Err(Error::Validation("max_segments must be at least 1".into()));
    }

    let mut document = String::with_capacity(request.document.len());
    let mut blank_run = 0;
    for line in request.document.replace("\r\n", "\n").replace('\r', "\n").lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        document.push_str(line);
        document.push('\n');
    }

    let document = document.trim().to_string();
    if document.is_empty() {
        return Err(Error::Validation(format!(
            "document '{}' has no text",
            request.source
        )));
    }
    Ok(document)
}

/// Why the avatar stage will not run, if it will not.
fn avatar_skip_reason(request: &RunRequest, routes: &Routes) -> Option<String> {
    let Some(avatar) = request.options.avatar.as_ref() else {
        return Some("no avatar requested".into());
    };
    if !avatar.face_image.exists() {
        return Some(format!(
            "face image {} does not exist",
            avatar.face_image.display()
        ));
    }
    if routes.chain(Stage::SyncAvatar).is_empty() {
        return Some("no avatar capability bound".into());
    }
    None
}

/// Remove segments that failed `stage`, returning how many were removed.
fn drop_lost(segments: &mut Vec<Segment>, stage: Stage) -> usize {
    let before = segments.len();
    segments.retain(|s| !s.status(stage).is_failed());
    before - segments.len()
}

fn summarize(
    run: &Run,
    routes: &Routes,
    output: PathBuf,
    composed: &ComposedOutput,
    segments: &[Segment],
    dropped: usize,
) -> RunSummary {
    let providers_used = Stage::CAPABILITY_STAGES
        .into_iter()
        .filter_map(|stage| {
            let report = run.stages.get(&stage)?;
            let mut used: Vec<(&String, &usize)> = report.capabilities_used.iter().collect();
            if used.is_empty() {
                return None;
            }
            used.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let used: Vec<String> = used.into_iter().map(|(name, _)| name.clone()).collect();
            let preferred = routes.route(stage).and_then(|r| r.preferred());
            if used.len() == 1 && preferred == Some(used[0].as_str()) {
                None
            } else {
                Some((stage, used))
            }
        })
        .collect();

    let completed_at = run.completed_at.unwrap_or_else(chrono::Utc::now);
    RunSummary {
        run_id: run.id,
        source: run.source.clone(),
        provider: run.provider.clone(),
        output,
        total_duration: composed.measured_duration,
        segments: segments.len(),
        dropped,
        outcome: run
            .outcome
            .clone()
            .unwrap_or(sc_core::RunOutcome::Succeeded),
        stages: run.stages.clone(),
        providers_used,
        segment_status: segments
            .iter()
            .map(|seg| (seg.index, seg.status.clone()))
            .collect(),
        created_at: run.created_at,
        completed_at,
        processing_secs: (completed_at - run.created_at).num_milliseconds() as f64 / 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{NarrationCapability, OutlineCapability};
    use crate::capability::{Capability, CapabilityResponse, InvokeContext};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use sc_av::compose::testing::FakeBackend;
    use sc_core::config::RetryConfig;
    use sc_core::{
        AudioArtifact, AvatarRequest, CapabilityFailure, ContentUnit, RunOptions, RunOutcome,
        VisualArtifact,
    };
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    const LESSON: &str = "# Intro\n- Names map to numbers\n- Caches help\n\n\
                          # Resolvers\n- Recursive lookups\n\n\
                          # Summary\n- DNS is a directory";

    /// Writes a blank PNG at the requested size.
    struct PngSlides {
        name: &'static str,
        fail_for: HashSet<u32>,
    }

    #[async_trait]
    impl Capability for PngSlides {
        fn name(&self) -> &str {
            self.name
        }
        fn stage(&self) -> Stage {
            Stage::GenerateVisual
        }
        async fn invoke(
            &self,
            request: CapabilityRequest,
            ctx: &InvokeContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            let CapabilityRequest::Visual { index, width, height, .. } = request else {
                return Err(CapabilityFailure::permanent("not a visual request"));
            };
            if self.fail_for.contains(&index) {
                return Err(CapabilityFailure::permanent("renderer rejected slide"));
            }
            let path = ctx.artifact_path(Some(index), self.name, "png");
            image::RgbImage::new(width, height)
                .save(&path)
                .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
            Ok(CapabilityResponse::Visual(VisualArtifact { path, width, height }))
        }
    }

    /// Writes a placeholder audio file lasting two seconds.
    struct Tone {
        broken: bool,
    }

    #[async_trait]
    impl Capability for Tone {
        fn name(&self) -> &str {
            "tone"
        }
        fn stage(&self) -> Stage {
            Stage::SynthesizeSpeech
        }
        async fn invoke(
            &self,
            request: CapabilityRequest,
            ctx: &InvokeContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            if self.broken {
                return Err(CapabilityFailure::permanent("voice not found"));
            }
            let index = request.index().unwrap_or_default();
            let path = ctx.artifact_path(Some(index), "tone", "wav");
            tokio::fs::write(&path, b"RIFF")
                .await
                .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
            Ok(CapabilityResponse::Speech(AudioArtifact {
                path,
                duration: Duration::from_secs(2),
            }))
        }
    }

    /// Speech that keeps every script it was asked to voice.
    #[derive(Default)]
    struct ScriptLog {
        scripts: Arc<Mutex<Vec<(u32, String)>>>,
    }

    #[async_trait]
    impl Capability for ScriptLog {
        fn name(&self) -> &str {
            "log"
        }
        fn stage(&self) -> Stage {
            Stage::SynthesizeSpeech
        }
        async fn invoke(
            &self,
            request: CapabilityRequest,
            ctx: &InvokeContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            let CapabilityRequest::Speech { script, index, .. } = request else {
                return Err(CapabilityFailure::permanent("not a speech request"));
            };
            self.scripts.lock().unwrap().push((index, script));
            let path = ctx.artifact_path(Some(index), "log", "wav");
            tokio::fs::write(&path, b"RIFF")
                .await
                .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
            Ok(CapabilityResponse::Speech(AudioArtifact {
                path,
                duration: Duration::from_secs(2),
            }))
        }
    }

    /// Understanding that returns a fixed outline.
    struct FixedOutline {
        units: Vec<ContentUnit>,
    }

    #[async_trait]
    impl Capability for FixedOutline {
        fn name(&self) -> &str {
            "fixed"
        }
        fn stage(&self) -> Stage {
            Stage::Understand
        }
        async fn invoke(
            &self,
            _request: CapabilityRequest,
            _ctx: &InvokeContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            Ok(CapabilityResponse::Outline(self.units.clone()))
        }
    }

    fn unit(title: &str, points: &[&str]) -> ContentUnit {
        ContentUnit {
            title: title.into(),
            key_points: points.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    fn fixed_outline(units: Vec<ContentUnit>) -> Harness {
        harness(
            vec![
                Arc::new(FixedOutline { units }),
                Arc::new(PngSlides {
                    name: "slides",
                    fail_for: HashSet::new(),
                }),
                Arc::new(Tone { broken: false }),
            ],
            standard_bindings().with_default(Stage::Understand, ["fixed"]),
        )
    }

    struct Harness {
        driver: PipelineDriver,
        backend: Arc<FakeBackend>,
        work: tempfile::TempDir,
        out: tempfile::TempDir,
    }

    fn harness(capabilities: Vec<Arc<dyn Capability>>, bindings: BindingTable) -> Harness {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(Arc::new(OutlineCapability::new("outline", 7)))
            .unwrap();
        registry
            .register(Arc::new(NarrationCapability::new("narration")))
            .unwrap();
        for cap in capabilities {
            registry.register(cap).unwrap();
        }

        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut settings = RunSettings {
            retry: RetryConfig {
                max_retries: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            work_root: work.path().to_path_buf(),
            output_dir: out.path().to_path_buf(),
            ..RunSettings::default()
        };
        settings.composition.width = 64;
        settings.composition.height = 36;

        let backend = Arc::new(FakeBackend::default());
        let driver = PipelineDriver::new(
            Arc::new(registry),
            Arc::new(bindings),
            settings,
            backend.clone(),
        );
        Harness {
            driver,
            backend,
            work,
            out,
        }
    }

    fn standard_bindings() -> BindingTable {
        BindingTable::new()
            .with_default(Stage::GenerateVisual, ["slides"])
            .with_default(Stage::SynthesizeSpeech, ["tone"])
    }

    fn standard(fail_for: &[u32], broken_speech: bool) -> Harness {
        harness(
            vec![
                Arc::new(PngSlides {
                    name: "slides",
                    fail_for: fail_for.iter().copied().collect(),
                }),
                Arc::new(Tone {
                    broken: broken_speech,
                }),
            ],
            standard_bindings(),
        )
    }

    fn request(document: &str) -> RunRequest {
        RunRequest {
            source: "lesson.md".into(),
            document: document.into(),
            provider: "edge".into(),
            options: RunOptions::default(),
        }
    }

    #[tokio::test]
    async fn full_run_composes_every_segment() {
        let h = standard(&[], false);
        let events = EventBus::default();

        let summary = h
            .driver
            .execute(request(LESSON), CancellationToken::new(), &events)
            .await
            .unwrap();

        assert_eq!(summary.segments, 3);
        assert_eq!(summary.dropped, 0);
        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert_eq!(summary.total_duration, Duration::from_secs(6));
        assert_eq!(summary.output, h.out.path().join("video.mp4"));
        assert!(summary.output.exists());
        assert_eq!(h.backend.rendered_indices(), vec![0, 1, 2]);
        assert_eq!(h.backend.copy_calls(), 1);
        assert!(summary.providers_used.is_empty());
        assert_eq!(
            summary.stages[&Stage::SyncAvatar].state,
            sc_core::StageState::Skipped
        );
        assert_eq!(
            summary.stages[&Stage::Compose].capabilities_used.get("fast_copy"),
            Some(&3)
        );

        // The run workspace is gone once the run returns.
        assert_eq!(std::fs::read_dir(h.work.path()).unwrap().count(), 0);

        let recent = events.recent_events(1);
        assert_matches!(&recent[0].payload, EventPayload::RunCompleted { duration_secs, .. } if *duration_secs == 6.0);
    }

    #[tokio::test]
    async fn lost_segment_is_dropped_and_order_kept() {
        let h = standard(&[1], false);
        let summary = h
            .driver
            .execute(request(LESSON), CancellationToken::new(), &EventBus::default())
            .await
            .unwrap();

        assert_eq!(summary.segments, 2);
        assert_eq!(summary.outcome, RunOutcome::PartiallySucceeded { dropped: 1 });
        assert_eq!(h.backend.rendered_indices(), vec![0, 2]);
        assert_eq!(summary.stages[&Stage::GenerateVisual].failed, 1);
        assert_eq!(summary.total_duration, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn mandatory_stage_exhaustion_fails_run() {
        let h = standard(&[], true);
        let events = EventBus::default();
        let err = h
            .driver
            .execute(request(LESSON), CancellationToken::new(), &events)
            .await
            .unwrap_err();

        assert_matches!(
            err,
            Error::StageExhaustion {
                stage: Stage::SynthesizeSpeech,
                ..
            }
        );
        assert!(!h.out.path().join("video.mp4").exists());
        assert!(h.backend.rendered_indices().is_empty());
        assert_matches!(
            &events.recent_events(1)[0].payload,
            EventPayload::RunFailed {
                stage: Some(Stage::SynthesizeSpeech),
                ..
            }
        );
    }

    #[tokio::test]
    async fn max_segments_limits_units() {
        let h = standard(&[], false);
        let mut req = request(LESSON);
        req.options.max_segments = Some(2);
        let summary = h
            .driver
            .execute(req, CancellationToken::new(), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(summary.segments, 2);
        assert_eq!(h.backend.rendered_indices(), vec![0, 1]);
    }

    #[tokio::test]
    async fn empty_document_fails_at_ingest() {
        let h = standard(&[], false);
        let events = EventBus::default();
        let err = h
            .driver
            .execute(request("   \n\n"), CancellationToken::new(), &events)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));
        assert_matches!(
            &events.recent_events(1)[0].payload,
            EventPayload::RunFailed {
                stage: Some(Stage::Ingest),
                ..
            }
        );
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_work() {
        let h = standard(&[], false);
        let token = CancellationToken::new();
        token.cancel();
        let err = h
            .driver
            .execute(request(LESSON), token, &EventBus::default())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled);
        assert!(h.backend.rendered_indices().is_empty());
    }

    #[tokio::test]
    async fn fallback_capability_is_reported() {
        let bindings = BindingTable::new()
            .bind("edge", Stage::GenerateVisual, ["fancy", "slides"])
            .bind("edge", Stage::SynthesizeSpeech, ["tone"]);
        let h = harness(
            vec![
                Arc::new(PngSlides {
                    name: "fancy",
                    fail_for: [0, 1, 2].into_iter().collect(),
                }),
                Arc::new(PngSlides {
                    name: "slides",
                    fail_for: HashSet::new(),
                }),
                Arc::new(Tone { broken: false }),
            ],
            bindings,
        );
        let summary = h
            .driver
            .execute(request(LESSON), CancellationToken::new(), &EventBus::default())
            .await
            .unwrap();

        assert_eq!(summary.dropped, 0);
        assert_eq!(
            summary.providers_used.get(&Stage::GenerateVisual),
            Some(&vec!["slides".to_string()])
        );
        assert!(!summary.providers_used.contains_key(&Stage::SynthesizeSpeech));
    }

    #[tokio::test]
    async fn avatar_skipped_when_face_missing() {
        let h = standard(&[], false);
        let mut req = request(LESSON);
        req.options.avatar = Some(AvatarRequest {
            face_image: h.work.path().join("nope.png"),
        });
        let summary = h
            .driver
            .execute(req, CancellationToken::new(), &EventBus::default())
            .await
            .unwrap();
        let avatar = &summary.stages[&Stage::SyncAvatar];
        assert_eq!(avatar.state, sc_core::StageState::Skipped);
        assert!(avatar.cause.as_deref().unwrap().contains("does not exist"));
        assert_eq!(summary.outcome, RunOutcome::Succeeded);
    }

    #[tokio::test]
    async fn unrenderable_clip_drops_its_segment() {
        let h = standard(&[], false);
        h.backend.fail_render(1);
        let summary = h
            .driver
            .execute(request(LESSON), CancellationToken::new(), &EventBus::default())
            .await
            .unwrap();

        assert_eq!(summary.segments, 2);
        assert_eq!(summary.outcome, RunOutcome::PartiallySucceeded { dropped: 1 });
        assert_eq!(summary.stages[&Stage::Compose].failed, 1);
        assert_eq!(summary.total_duration, Duration::from_secs(4));
        assert!(!summary.segment_status.contains_key(&1));
        assert!(summary.output.exists());
    }

    #[tokio::test]
    async fn rejected_unit_counts_as_dropped() {
        let h = fixed_outline(vec![unit("Intro", &["Names map to numbers"]), unit("Empty", &[])]);
        let summary = h
            .driver
            .execute(request(LESSON), CancellationToken::new(), &EventBus::default())
            .await
            .unwrap();

        assert_eq!(summary.segments, 1);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.outcome, RunOutcome::PartiallySucceeded { dropped: 1 });
        assert_eq!(summary.stages[&Stage::Understand].failed, 1);
        assert_eq!(h.backend.rendered_indices(), vec![0]);
    }

    #[tokio::test]
    async fn only_unit_rejected_exhausts_understand() {
        let h = fixed_outline(vec![unit("Empty", &["  "])]);
        let events = EventBus::default();
        let err = h
            .driver
            .execute(request(LESSON), CancellationToken::new(), &events)
            .await
            .unwrap_err();

        assert_matches!(
            err,
            Error::StageExhaustion {
                stage: Stage::Understand,
                ..
            }
        );
        assert!(h.backend.rendered_indices().is_empty());
        assert_matches!(
            &events.recent_events(1)[0].payload,
            EventPayload::RunFailed {
                stage: Some(Stage::Understand),
                ..
            }
        );
    }

    #[tokio::test]
    async fn narration_closes_on_last_surviving_segment() {
        const FOUR: &str = "# Intro\n- Names map to numbers\n\n\
                            # Resolvers\n- Recursive lookups\n\n\
                            # Records\n- A and AAAA\n\n\
                            # Summary\n- DNS is a directory";
        let log = ScriptLog::default();
        let scripts = log.scripts.clone();
        let h = harness(
            vec![
                Arc::new(PngSlides {
                    name: "slides",
                    fail_for: [0, 3].into_iter().collect(),
                }),
                Arc::new(log),
            ],
            BindingTable::new()
                .with_default(Stage::GenerateVisual, ["slides"])
                .with_default(Stage::SynthesizeSpeech, ["log"]),
        );
        let summary = h
            .driver
            .execute(request(FOUR), CancellationToken::new(), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(summary.dropped, 2);

        let mut scripts = scripts.lock().unwrap().clone();
        scripts.sort();
        assert_eq!(scripts.len(), 2);
        let (first, second) = (&scripts[0], &scripts[1]);
        assert_eq!(first.0, 1);
        assert!(first.1.starts_with("Welcome, everyone!"));
        assert!(!first.1.contains("wraps up"));
        assert_eq!(second.0, 2);
        assert!(second.1.starts_with("Now let's look at Records."));
        assert!(second.1.ends_with("Thanks for watching!"));
    }

    #[test]
    fn ingest_normalizes_whitespace() {
        let doc = ingest(&request("  \r\n# Title  \r\n\r\n\r\n\r\nBody text.\t\r\n\n")).unwrap();
        assert_eq!(doc, "# Title\n\nBody text.");
    }

    #[test]
    fn ingest_rejects_empty_document() {
        let err = ingest(&request(" \n\t\n")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.is_run_fatal());
    }

    #[test]
    fn ingest_rejects_zero_segment_limit() {
        let mut req = request("text");
        req.options.max_segments = Some(0);
        assert!(matches!(ingest(&req), Err(Error::Validation(_))));
    }

    #[test]
    fn drop_lost_removes_only_failed() {
        let mut segments: Vec<Segment> = (0..3)
            .map(|i| Segment::new(i, Default::default()))
            .collect();
        segments[1].set_status(
            Stage::GenerateVisual,
            sc_core::SegmentStatus::Failed {
                cause: "x".into(),
            },
        );
        assert_eq!(drop_lost(&mut segments, Stage::GenerateVisual), 1);
        assert_eq!(
            segments.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 2]
        );
    }
}
