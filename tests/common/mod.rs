//! Shared fixtures: fake capabilities and a driver wired to the fake media
//! backend, so runs complete without ffmpeg.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sc_av::compose::testing::FakeBackend;
use sc_core::config::RetryConfig;
use sc_core::{
    AudioArtifact, AvatarArtifact, CapabilityFailure, ContentUnit, RunOptions, RunRequest, Stage,
    VisualArtifact,
};
use sc_pipeline::capabilities::{NarrationCapability, OutlineCapability};
use sc_pipeline::{
    BindingTable, Capability, CapabilityRegistry, CapabilityRequest, CapabilityResponse,
    InvokeContext, PipelineDriver, RunSettings,
};
use tempfile::TempDir;

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 36;

pub const LESSON: &str = "# What DNS does\n\
- Turns names into addresses\n\
- Works like a phone book\n\n\
# Resolvers\n\
- Ask other servers on your behalf\n\
- Cache answers for a while\n\n\
# Records\n\
- A records hold IPv4 addresses\n\n\
# Wrap up\n\
- DNS is everywhere";

/// Writes a black PNG at the requested size; can reject chosen segments.
pub struct Slides {
    pub name: &'static str,
    pub reject: HashSet<u32>,
    pub calls: Arc<AtomicUsize>,
}

impl Slides {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            reject: HashSet::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn rejecting(mut self, indices: &[u32]) -> Self {
        self.reject = indices.iter().copied().collect();
        self
    }
}

#[async_trait]
impl Capability for Slides {
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        let CapabilityRequest::Visual { index, .. } = request else {
            return Err(CapabilityFailure::permanent("expected a visual request"));
        };
        if self.reject.contains(&index) {
            return Err(CapabilityFailure::permanent("slide rejected"));
        }
        // Off-size on purpose; the executor normalizes it.
        let path = ctx.artifact_path(Some(index), self.name, "png");
        image::RgbImage::new(WIDTH * 2, HEIGHT)
            .save(&path)
            .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
        Ok(CapabilityResponse::Visual(VisualArtifact {
            path,
            width: WIDTH * 2,
            height: HEIGHT,
        }))
    }
}

/// Speech whose duration grows with the segment index (2s, 3s, ...).
pub struct Speech {
    pub transient_failures: usize,
    pub calls: Arc<AtomicUsize>,
}

impl Speech {
    pub fn new() -> Self {
        Self {
            transient_failures: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub fn speech_duration(index: u32) -> Duration {
    Duration::from_secs(2 + u64::from(index))
}

#[async_trait]
impl Capability for Speech {
    fn name(&self) -> &str {
        "speech"
    }

    fn stage(&self) -> Stage {
        Stage::SynthesizeSpeech
    }

    async fn invoke(
        &self,
        request: CapabilityRequest,
        ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.transient_failures {
            return Err(CapabilityFailure::transient("service unavailable"));
        }
        let index = request.index().unwrap_or_default();
        let path = ctx.artifact_path(Some(index), "speech", "wav");
        tokio::fs::write(&path, b"RIFF")
            .await
            .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
        Ok(CapabilityResponse::Speech(AudioArtifact {
            path,
            duration: speech_duration(index),
        }))
    }
}

/// Speech service that is always unavailable for one segment.
pub struct FlakySpeech {
    pub unavailable_for: u32,
    pub calls: Arc<AtomicUsize>,
}

impl FlakySpeech {
    pub fn new(unavailable_for: u32) -> Self {
        Self {
            unavailable_for,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Capability for FlakySpeech {
    fn name(&self) -> &str {
        "flaky_tts"
    }

    fn stage(&self) -> Stage {
        Stage::SynthesizeSpeech
    }

    async fn invoke(
        &self,
        request: CapabilityRequest,
        ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        let index = request.index().unwrap_or_default();
        if index == self.unavailable_for {
            self.calls.fetch_add(1, Ordering::SeqCst);
            return Err(CapabilityFailure::transient("503 service unavailable"));
        }
        let path = ctx.artifact_path(Some(index), "flaky_tts", "wav");
        tokio::fs::write(&path, b"RIFF")
            .await
            .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
        Ok(CapabilityResponse::Speech(AudioArtifact {
            path,
            duration: speech_duration(index),
        }))
    }
}

/// Understanding that returns a fixed list of units.
pub struct FixedOutline(pub Vec<ContentUnit>);

#[async_trait]
impl Capability for FixedOutline {
    fn name(&self) -> &str {
        "fixed_outline"
    }

    fn stage(&self) -> Stage {
        Stage::Understand
    }

    async fn invoke(
        &self,
        _request: CapabilityRequest,
        _ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        Ok(CapabilityResponse::Outline(self.0.clone()))
    }
}

pub fn unit(title: &str, points: &[&str]) -> ContentUnit {
    ContentUnit {
        title: title.into(),
        key_points: points.iter().map(|p| p.to_string()).collect(),
        ..Default::default()
    }
}

/// Lip-sync fake returning a clip one second shorter than the audio.
pub struct Avatar;

#[async_trait]
impl Capability for Avatar {
    fn name(&self) -> &str {
        "lipsync"
    }

    fn stage(&self) -> Stage {
        Stage::SyncAvatar
    }

    async fn invoke(
        &self,
        request: CapabilityRequest,
        ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        let index = request.index().unwrap_or_default();
        if index == 1 {
            return Err(CapabilityFailure::permanent("no face detected"));
        }
        let path = ctx.artifact_path(Some(index), "lipsync", "mp4");
        tokio::fs::write(&path, b"avatar")
            .await
            .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
        Ok(CapabilityResponse::Avatar(AvatarArtifact {
            path,
            duration: speech_duration(index) - Duration::from_secs(1),
        }))
    }
}

pub struct Harness {
    pub driver: PipelineDriver,
    pub backend: Arc<FakeBackend>,
    pub work: TempDir,
    pub out: TempDir,
}

impl Harness {
    pub fn new(capabilities: Vec<Arc<dyn Capability>>, bindings: BindingTable) -> Self {
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
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
            },
            max_concurrency: 2,
            work_root: work.path().to_path_buf(),
            output_dir: out.path().to_path_buf(),
            ..RunSettings::default()
        };
        settings.composition.width = WIDTH;
        settings.composition.height = HEIGHT;

        let backend = Arc::new(FakeBackend::default());
        let driver = PipelineDriver::new(
            Arc::new(registry),
            Arc::new(bindings),
            settings,
            backend.clone(),
        );
        Self {
            driver,
            backend,
            work,
            out,
        }
    }

    /// Slides, speech and avatar bound as defaults.
    pub fn standard() -> Self {
        Self::new(
            vec![
                Arc::new(Slides::new("slides")),
                Arc::new(Speech::new()),
                Arc::new(Avatar),
            ],
            default_bindings(),
        )
    }

    pub fn leftover_run_dirs(&self) -> usize {
        std::fs::read_dir(self.work.path()).unwrap().count()
    }
}

pub fn default_bindings() -> BindingTable {
    BindingTable::new()
        .with_default(Stage::GenerateVisual, ["slides"])
        .with_default(Stage::SynthesizeSpeech, ["speech"])
        .with_default(Stage::SyncAvatar, ["lipsync"])
}

pub fn request(document: &str) -> RunRequest {
    RunRequest {
        source: "dns.md".into(),
        document: document.into(),
        provider: "default".into(),
        options: RunOptions::default(),
    }
}

pub fn write_face(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("face.png");
    image::RgbImage::new(8, 8).save(&path).unwrap();
    path
}
