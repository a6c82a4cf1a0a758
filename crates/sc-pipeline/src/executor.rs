//! Stage executor: runs one stage's capability chain over every segment.
//!
//! For each segment the chain is tried in preference order. A transient
//! failure is retried with exponential backoff before falling through to the
//! next capability; a permanent failure falls through immediately. Segments
//! are independent, so invocations run concurrently up to
//! [`RunSettings::max_concurrency`](crate::context::RunSettings).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use sc_core::run::StageReport;
use sc_core::{CapabilityFailure, ContentUnit, Error, Segment, SegmentStatus, Stage};
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};

use crate::capability::{Capability, CapabilityRequest, CapabilityResponse};
use crate::context::StageContext;
use crate::router::StageRoute;

/// Counts and capability usage for one executed stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Capability name -> number of segments it produced.
    pub capabilities_used: BTreeMap<String, usize>,
    /// Segments satisfied by a capability other than the first preference.
    pub fallback_used: usize,
    pub from_defaults: bool,
}

impl StageOutcome {
    fn record(&mut self, status: &SegmentStatus) {
        match status {
            SegmentStatus::Done { capability } => {
                self.succeeded += 1;
                *self.capabilities_used.entry(capability.clone()).or_default() += 1;
            }
            SegmentStatus::FallbackUsed { capability, .. } => {
                self.succeeded += 1;
                self.fallback_used += 1;
                *self.capabilities_used.entry(capability.clone()).or_default() += 1;
            }
            SegmentStatus::Failed { .. } => self.failed += 1,
            SegmentStatus::Pending => {}
        }
    }

    /// Capabilities that produced results, most used first.
    pub fn used_names(&self) -> Vec<String> {
        let mut used: Vec<_> = self.capabilities_used.iter().collect();
        used.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        used.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn into_report(self) -> StageReport {
        StageReport {
            succeeded: self.succeeded,
            failed: self.failed,
            capabilities_used: self.capabilities_used,
            fallback_used: self.fallback_used,
            resolved_from_defaults: self.from_defaults,
            ..Default::default()
        }
    }
}

/// Why a single attempt did not produce a response.
#[derive(Debug)]
enum AttemptError {
    Failed(CapabilityFailure),
    Cancelled,
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Failed(failure) => write!(f, "{failure}"),
            AttemptError::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result of walking a whole chain for one request.
enum ChainResult {
    Produced {
        response: CapabilityResponse,
        status: SegmentStatus,
    },
    Exhausted(String),
    Cancelled,
}

/// Executes capability stages.
#[derive(Debug, Default, Clone, Copy)]
pub struct StageExecutor;

impl StageExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run the understanding stage over the whole document.
    ///
    /// Returns the units of the first capability that yields a non-empty
    /// outline. Exhausting the chain fails the stage.
    pub async fn run_outline(
        &self,
        route: &StageRoute,
        document: &str,
        max_units: Option<usize>,
        ctx: &StageContext,
    ) -> sc_core::Result<(Vec<ContentUnit>, StageOutcome)> {
        let request = CapabilityRequest::Understand {
            document: document.to_string(),
            max_units,
        };

        let mut outcome = StageOutcome {
            from_defaults: route.from_defaults,
            ..Default::default()
        };

        match self.invoke_chain(route, request, ctx).await {
            ChainResult::Produced {
                response: CapabilityResponse::Outline(units),
                status,
            } => {
                outcome.record(&status);
                Ok((units, outcome))
            }
            ChainResult::Produced { .. } => Err(Error::Internal(
                "understanding chain returned a non-outline response".into(),
            )),
            ChainResult::Exhausted(cause) => Err(Error::exhausted(Stage::Understand, cause)),
            ChainResult::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Run a per-segment stage.
    ///
    /// `build` turns a segment into its request; segments for which it
    /// returns `None` are left untouched. Results are written back into the
    /// matching segment by index, with the outcome recorded in
    /// `segment.status`. A mandatory stage in which no segment succeeds
    /// returns [`Error::StageExhaustion`].
    pub async fn run<F>(
        &self,
        route: &StageRoute,
        segments: &mut [Segment],
        ctx: &StageContext,
        build: F,
    ) -> sc_core::Result<StageOutcome>
    where
        F: Fn(&Segment) -> Option<CapabilityRequest>,
    {
        let stage = ctx.stage;
        let requests: Vec<(usize, CapabilityRequest)> = segments
            .iter()
            .enumerate()
            .filter_map(|(pos, seg)| build(seg).map(|req| (pos, req)))
            .collect();
        let attempted = requests.len();

        tracing::info!(
            "{stage}: {attempted} segment(s) via [{}]",
            route.names().join(", ")
        );

        let limit = ctx.settings.max_concurrency.max(1);
        let results: Vec<(usize, ChainResult)> = stream::iter(requests)
            .map(|(pos, request)| async move { (pos, self.invoke_chain(route, request, ctx).await) })
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut outcome = StageOutcome {
            from_defaults: route.from_defaults,
            ..Default::default()
        };
        let mut cancelled = false;

        for (pos, result) in results {
            let segment = &mut segments[pos];
            let status = match result {
                ChainResult::Produced { response, status } => {
                    apply_response(segment, response);
                    status
                }
                ChainResult::Exhausted(cause) => {
                    if stage.is_mandatory() {
                        tracing::warn!(
                            "{}",
                            Error::SegmentLoss {
                                stage,
                                index: segment.index,
                                cause: cause.clone(),
                            }
                        );
                    } else {
                        tracing::warn!("{stage}: segment {} continues without: {cause}", segment.index);
                    }
                    SegmentStatus::Failed { cause }
                }
                ChainResult::Cancelled => {
                    cancelled = true;
                    continue;
                }
            };
            outcome.record(&status);
            segment.set_status(stage, status);
        }

        if cancelled || ctx.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if stage.is_mandatory() && attempted > 0 && outcome.succeeded == 0 {
            return Err(Error::exhausted(
                stage,
                format!("all {attempted} segment(s) failed"),
            ));
        }

        Ok(outcome)
    }

    /// Walk the chain for one request.
    async fn invoke_chain(
        &self,
        route: &StageRoute,
        request: CapabilityRequest,
        ctx: &StageContext,
    ) -> ChainResult {
        let label = request
            .index()
            .map(|i| format!("segment {i}"))
            .unwrap_or_else(|| "document".to_string());

        if route.is_empty() {
            return ChainResult::Exhausted(format!("no capability available for {}", ctx.stage));
        }

        let mut skipped: Vec<String> = Vec::new();
        let mut causes: Vec<String> = Vec::new();

        for capability in &route.capabilities {
            if ctx.cancellation.is_cancelled() {
                return ChainResult::Cancelled;
            }

            match self.invoke_with_retry(capability.as_ref(), &request, ctx).await {
                Ok(response) => {
                    let name = capability.name().to_string();
                    let status = if skipped.is_empty() {
                        SegmentStatus::Done { capability: name }
                    } else {
                        tracing::info!(
                            "{}: {label} fell back to '{name}' after [{}]",
                            ctx.stage,
                            skipped.join(", ")
                        );
                        SegmentStatus::FallbackUsed {
                            capability: name,
                            skipped,
                        }
                    };
                    return ChainResult::Produced { response, status };
                }
                Err(AttemptError::Cancelled) => return ChainResult::Cancelled,
                Err(AttemptError::Failed(failure)) => {
                    tracing::warn!(
                        "{}: '{}' failed for {label}: {failure}",
                        ctx.stage,
                        capability.name()
                    );
                    skipped.push(capability.name().to_string());
                    causes.push(format!("{}: {}", capability.name(), failure.cause));
                }
            }
        }

        ChainResult::Exhausted(causes.join("; "))
    }

    /// Invoke one capability, retrying transient failures.
    async fn invoke_with_retry(
        &self,
        capability: &dyn Capability,
        request: &CapabilityRequest,
        ctx: &StageContext,
    ) -> Result<CapabilityResponse, AttemptError> {
        let retry = &ctx.settings.retry;
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(retry.initial_backoff_ms / 2)
            .max_delay(Duration::from_millis(retry.max_backoff_ms))
            .map(jitter)
            .take(retry.max_retries);

        let invoke_ctx = &ctx.invoke_context(capability.name());
        let attempts = &AtomicUsize::new(0);

        Retry::spawn(strategy, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > 1 {
                tracing::debug!("retrying '{}' (attempt {attempt})", capability.name());
            }

            let result = tokio::select! {
                biased;
                _ = invoke_ctx.cancellation.cancelled() => Err(AttemptError::Cancelled),
                res = tokio::time::timeout(invoke_ctx.timeout, capability.invoke(request.clone(), &invoke_ctx)) => {
                    match res {
                        Ok(Ok(response)) => self.finish(capability, response, ctx).await.map_err(AttemptError::Failed),
                        Ok(Err(failure)) => Err(AttemptError::Failed(failure)),
                        Err(_) => Err(AttemptError::Failed(CapabilityFailure::transient(format!(
                            "timed out after {}s",
                            invoke_ctx.timeout.as_secs_f64()
                        )))),
                    }
                }
            };

            match result {
                Ok(response) => Ok(response),
                Err(AttemptError::Failed(failure)) if failure.is_transient() => {
                    tracing::debug!("transient failure from '{}': {}", capability.name(), failure.cause);
                    Err(RetryError::Transient {
                        err: AttemptError::Failed(failure),
                        retry_after: None,
                    })
                }
                Err(e) => Err(RetryError::Permanent(e)),
            }
        })
        .await
    }

    /// Validate a response and bring visuals to the output resolution.
    async fn finish(
        &self,
        capability: &dyn Capability,
        response: CapabilityResponse,
        ctx: &StageContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        if response.stage() != ctx.stage {
            return Err(CapabilityFailure::permanent(format!(
                "'{}' answered a {} request with a {} response",
                capability.name(),
                ctx.stage,
                response.stage()
            )));
        }

        match response {
            CapabilityResponse::Outline(units) if units.is_empty() => {
                Err(CapabilityFailure::permanent("outline has no content units"))
            }
            CapabilityResponse::Script(script) if script.trim().is_empty() => {
                Err(CapabilityFailure::permanent("empty script"))
            }
            CapabilityResponse::Speech(audio) if audio.duration.is_zero() => {
                Err(CapabilityFailure::permanent(format!(
                    "zero-length audio at {}",
                    audio.path.display()
                )))
            }
            CapabilityResponse::Visual(visual) => {
                let profile = &ctx.settings.composition;
                let (width, height) = (profile.width, profile.height);
                let normalized = tokio::task::spawn_blocking(move || {
                    sc_av::normalize_visual(&visual, width, height)
                })
                .await
                .map_err(|e| CapabilityFailure::permanent(format!("normalization task failed: {e}")))?
                .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
                Ok(CapabilityResponse::Visual(normalized))
            }
            other => Ok(other),
        }
    }
}

/// Store a response on the segment it belongs to.
fn apply_response(segment: &mut Segment, response: CapabilityResponse) {
    match response {
        CapabilityResponse::Visual(visual) => segment.visual = Some(visual),
        CapabilityResponse::Script(script) => segment.script = Some(script),
        CapabilityResponse::Speech(audio) => segment.audio = Some(audio),
        CapabilityResponse::Avatar(avatar) => segment.avatar = Some(avatar),
        CapabilityResponse::Outline(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::InvokeContext;
    use crate::context::RunSettings;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use sc_core::config::RetryConfig;
    use sc_core::AudioArtifact;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    // -- Fake capabilities ----------------------------------------------------

    /// Fails the first `failures` calls with `kind`, then succeeds.
    struct Flaky {
        name: &'static str,
        stage: Stage,
        failures: usize,
        permanent: bool,
        calls: Arc<AtomicUsize>,
    }

    impl Flaky {
        fn new(name: &'static str, stage: Stage) -> Self {
            Self {
                name,
                stage,
                failures: 0,
                permanent: false,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
        fn failing(mut self, failures: usize, permanent: bool) -> Self {
            self.failures = failures;
            self.permanent = permanent;
            self
        }
    }

    #[async_trait]
    impl Capability for Flaky {
        fn name(&self) -> &str {
            self.name
        }
        fn stage(&self) -> Stage {
            self.stage
        }
        async fn invoke(
            &self,
            request: CapabilityRequest,
            _ctx: &InvokeContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(if self.permanent {
                    CapabilityFailure::permanent("bad input")
                } else {
                    CapabilityFailure::transient("503")
                });
            }
            Ok(match request {
                CapabilityRequest::Script { unit, .. } => {
                    CapabilityResponse::Script(format!("{} by {}", unit.title, self.name))
                }
                CapabilityRequest::Speech { index, .. } => CapabilityResponse::Speech(AudioArtifact {
                    path: format!("/tmp/{index}.wav").into(),
                    duration: Duration::from_secs(2),
                }),
                CapabilityRequest::Understand { .. } => CapabilityResponse::Outline(vec![ContentUnit {
                    title: "Intro".into(),
                    key_points: vec!["one".into()],
                    ..Default::default()
                }]),
                _ => return Err(CapabilityFailure::permanent("unsupported")),
            })
        }
    }

    /// Fails permanently for one segment index only.
    struct FailsFor {
        index: u32,
    }

    #[async_trait]
    impl Capability for FailsFor {
        fn name(&self) -> &str {
            "picky"
        }
        fn stage(&self) -> Stage {
            Stage::GenerateScript
        }
        async fn invoke(
            &self,
            request: CapabilityRequest,
            _ctx: &InvokeContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            if request.index() == Some(self.index) {
                Err(CapabilityFailure::permanent("refused"))
            } else {
                Ok(CapabilityResponse::Script("ok".into()))
            }
        }
    }

    /// Sleeps longer than any test deadline.
    struct Hangs;

    #[async_trait]
    impl Capability for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }
        fn stage(&self) -> Stage {
            Stage::GenerateScript
        }
        async fn invoke(
            &self,
            _request: CapabilityRequest,
            _ctx: &InvokeContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(CapabilityResponse::Script("late".into()))
        }
    }

    /// Answers with the wrong response kind.
    struct Confused;

    #[async_trait]
    impl Capability for Confused {
        fn name(&self) -> &str {
            "confused"
        }
        fn stage(&self) -> Stage {
            Stage::SynthesizeSpeech
        }
        async fn invoke(
            &self,
            _request: CapabilityRequest,
            _ctx: &InvokeContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            Ok(CapabilityResponse::Script("not audio".into()))
        }
    }

    /// Tracks the peak number of concurrent invocations.
    struct Gauge {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Capability for Gauge {
        fn name(&self) -> &str {
            "gauge"
        }
        fn stage(&self) -> Stage {
            Stage::GenerateScript
        }
        async fn invoke(
            &self,
            _request: CapabilityRequest,
            _ctx: &InvokeContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(CapabilityResponse::Script("ok".into()))
        }
    }

    // -- Helpers --------------------------------------------------------------

    fn settings(max_retries: usize, max_concurrency: usize) -> Arc<RunSettings> {
        Arc::new(RunSettings {
            retry: RetryConfig {
                max_retries,
                initial_backoff_ms: 2,
                max_backoff_ms: 5,
            },
            max_concurrency,
            invoke_timeout: Duration::from_millis(100),
            ..RunSettings::default()
        })
    }

    fn ctx(stage: Stage, settings: Arc<RunSettings>) -> StageContext {
        StageContext::new(stage, std::env::temp_dir(), settings)
    }

    fn route(stage: Stage, caps: Vec<Arc<dyn Capability>>) -> StageRoute {
        StageRoute {
            stage,
            capabilities: caps,
            from_defaults: false,
            skipped: vec![],
        }
    }

    fn segments(n: u32) -> Vec<Segment> {
        (0..n)
            .map(|i| {
                Segment::new(
                    i,
                    ContentUnit {
                        title: format!("Topic {i}"),
                        key_points: vec!["point".into()],
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    fn script_request(seg: &Segment) -> Option<CapabilityRequest> {
        Some(CapabilityRequest::Script {
            unit: seg.unit.clone(),
            index: seg.index,
            position: seg.index as usize,
            total: 3,
            detail: Default::default(),
        })
    }

    // -- Tests ----------------------------------------------------------------

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let cap = Flaky::new("llm", Stage::GenerateScript).failing(2, false);
        let calls = cap.calls.clone();
        let route = route(Stage::GenerateScript, vec![Arc::new(cap)]);
        let mut segs = segments(1);

        let outcome = StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::GenerateScript, settings(3, 2)), script_request)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.fallback_used, 0);
        assert_matches!(segs[0].status(Stage::GenerateScript), SegmentStatus::Done { capability } if capability == "llm");
        assert_eq!(segs[0].script.as_deref(), Some("Topic 0 by llm"));
    }

    #[tokio::test]
    async fn permanent_failure_falls_back_without_retry() {
        let first = Flaky::new("groq", Stage::GenerateScript).failing(usize::MAX, true);
        let first_calls = first.calls.clone();
        let second = Flaky::new("local", Stage::GenerateScript);
        let route = route(Stage::GenerateScript, vec![Arc::new(first), Arc::new(second)]);
        let mut segs = segments(2);

        let outcome = StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::GenerateScript, settings(3, 2)), script_request)
            .await
            .unwrap();

        assert_eq!(first_calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.fallback_used, 2);
        assert_eq!(outcome.capabilities_used.get("local"), Some(&2));
        assert_matches!(
            segs[1].status(Stage::GenerateScript),
            SegmentStatus::FallbackUsed { capability, skipped } if capability == "local" && skipped == &vec!["groq".to_string()]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back() {
        let first = Flaky::new("polly", Stage::SynthesizeSpeech).failing(usize::MAX, false);
        let first_calls = first.calls.clone();
        let second = Flaky::new("edge", Stage::SynthesizeSpeech);
        let route = route(Stage::SynthesizeSpeech, vec![Arc::new(first), Arc::new(second)]);
        let mut segs = segments(1);

        StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::SynthesizeSpeech, settings(2, 1)), |s| {
                Some(CapabilityRequest::Speech {
                    script: "hi".into(),
                    voice: None,
                    index: s.index,
                })
            })
            .await
            .unwrap();

        // One attempt plus two retries.
        assert_eq!(first_calls.load(Ordering::SeqCst), 3);
        assert_eq!(segs[0].audio.as_ref().unwrap().duration, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn single_segment_failure_does_not_fail_stage() {
        let route = route(Stage::GenerateScript, vec![Arc::new(FailsFor { index: 1 })]);
        let mut segs = segments(3);

        let outcome = StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::GenerateScript, settings(0, 3)), script_request)
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert!(segs[1].status(Stage::GenerateScript).is_failed());
        assert_eq!(segs[1].lost_mandatory_stage(), Some(Stage::GenerateScript));
        assert!(segs[0].script.is_some() && segs[2].script.is_some());
    }

    #[tokio::test]
    async fn mandatory_stage_with_no_success_is_exhausted() {
        let cap = Flaky::new("dead", Stage::GenerateScript).failing(usize::MAX, true);
        let route = route(Stage::GenerateScript, vec![Arc::new(cap)]);
        let mut segs = segments(2);

        let err = StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::GenerateScript, settings(0, 2)), script_request)
            .await
            .unwrap_err();
        assert_matches!(err, Error::StageExhaustion { stage: Stage::GenerateScript, .. });
    }

    #[tokio::test]
    async fn optional_stage_failure_is_absorbed() {
        let cap = Flaky::new("wav2lip", Stage::SyncAvatar).failing(usize::MAX, true);
        let route = route(Stage::SyncAvatar, vec![Arc::new(cap)]);
        let mut segs = segments(2);

        let outcome = StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::SyncAvatar, settings(0, 2)), |s| {
                Some(CapabilityRequest::Avatar {
                    audio: "/a.wav".into(),
                    face_image: "/face.png".into(),
                    index: s.index,
                })
            })
            .await
            .unwrap();

        assert_eq!(outcome.failed, 2);
        assert!(segs.iter().all(|s| s.avatar.is_none()));
        assert!(segs.iter().all(|s| s.lost_mandatory_stage().is_none()));
    }

    #[tokio::test]
    async fn timeout_counts_as_transient() {
        let fallback = Flaky::new("fast", Stage::GenerateScript);
        let route = route(Stage::GenerateScript, vec![Arc::new(Hangs), Arc::new(fallback)]);
        let mut segs = segments(1);

        StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::GenerateScript, settings(1, 1)), script_request)
            .await
            .unwrap();
        assert_eq!(segs[0].status(Stage::GenerateScript).capability(), Some("fast"));
    }

    #[tokio::test]
    async fn wrong_response_kind_is_permanent() {
        let fallback = Flaky::new("edge", Stage::SynthesizeSpeech);
        let route = route(Stage::SynthesizeSpeech, vec![Arc::new(Confused), Arc::new(fallback)]);
        let mut segs = segments(1);

        StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::SynthesizeSpeech, settings(3, 1)), |s| {
                Some(CapabilityRequest::Speech {
                    script: "x".into(),
                    voice: None,
                    index: s.index,
                })
            })
            .await
            .unwrap();
        assert_matches!(segs[0].status(Stage::SynthesizeSpeech), SegmentStatus::FallbackUsed { .. });
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cap = Gauge {
            current,
            peak: peak.clone(),
        };
        let route = route(Stage::GenerateScript, vec![Arc::new(cap)]);
        let mut segs = segments(8);

        StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::GenerateScript, settings(0, 3)), script_request)
            .await
            .unwrap();
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 2, "expected concurrent invocations, peak {peak}");
    }

    #[tokio::test]
    async fn cancellation_stops_the_stage() {
        let token = CancellationToken::new();
        let route = route(Stage::GenerateScript, vec![Arc::new(Hangs)]);
        let mut segs = segments(2);
        let ctx = ctx(Stage::GenerateScript, settings(0, 2)).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = StageExecutor::new()
            .run(&route, &mut segs, &ctx, script_request)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert_matches!(err, Error::Cancelled);
    }

    #[tokio::test]
    async fn empty_chain_exhausts_mandatory_stage() {
        let route = route(Stage::SynthesizeSpeech, vec![]);
        let mut segs = segments(1);
        let err = StageExecutor::new()
            .run(&route, &mut segs, &ctx(Stage::SynthesizeSpeech, settings(0, 1)), |s| {
                Some(CapabilityRequest::Speech {
                    script: "x".into(),
                    voice: None,
                    index: s.index,
                })
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::StageExhaustion { stage: Stage::SynthesizeSpeech, .. });
    }

    #[tokio::test]
    async fn outline_falls_back_and_reports() {
        let first = Flaky::new("llm", Stage::Understand).failing(usize::MAX, false);
        let second = Flaky::new("outline", Stage::Understand);
        let route = route(Stage::Understand, vec![Arc::new(first), Arc::new(second)]);

        let (units, outcome) = StageExecutor::new()
            .run_outline(&route, "# Intro\none", None, &ctx(Stage::Understand, settings(1, 1)))
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(outcome.fallback_used, 1);
        assert_eq!(outcome.used_names(), vec!["outline".to_string()]);
    }

    #[tokio::test]
    async fn outline_exhaustion_fails_stage() {
        let cap = Flaky::new("llm", Stage::Understand).failing(usize::MAX, true);
        let route = route(Stage::Understand, vec![Arc::new(cap)]);
        let err = StageExecutor::new()
            .run_outline(&route, "text", None, &ctx(Stage::Understand, settings(0, 1)))
            .await
            .unwrap_err();
        assert_matches!(err, Error::StageExhaustion { stage: Stage::Understand, .. });
    }

    #[test]
    fn outcome_into_report() {
        let mut outcome = StageOutcome::default();
        outcome.record(&SegmentStatus::Done {
            capability: "a".into(),
        });
        outcome.record(&SegmentStatus::FallbackUsed {
            capability: "b".into(),
            skipped: vec!["a".into()],
        });
        outcome.record(&SegmentStatus::Failed { cause: "x".into() });
        let report = outcome.into_report();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.fallback_used, 1);
        assert_eq!(report.capabilities_used.len(), 2);
    }
}
