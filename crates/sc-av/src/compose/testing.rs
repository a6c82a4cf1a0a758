//! In-memory [`MediaBackend`] for tests.
//!
//! Records every call, reports the planned duration for each rendered clip,
//! and can be told to diverge clip parameters or fail either concat path.
//! When the output's parent directory exists a placeholder file is written,
//! so callers that move the output afterwards behave as with ffmpeg.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sc_core::config::CompositionConfig;
use sc_core::Error;

use super::backend::MediaBackend;
use super::plan::ClipSpec;
use crate::probe::ClipParams;

#[derive(Default)]
struct State {
    rendered: Vec<ClipSpec>,
    params: HashMap<PathBuf, ClipParams>,
    durations: HashMap<PathBuf, Duration>,
    overrides: HashMap<u32, ClipParams>,
    fail_render: HashSet<u32>,
    fail_copy: bool,
    fail_reencode: bool,
    copy_skew: Duration,
    copy_calls: usize,
    reencode_calls: usize,
    last_concat: Vec<PathBuf>,
}

/// Scriptable fake media backend.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Make the clip for segment `index` report different parameters.
    pub fn override_params(&self, index: u32, f: impl FnOnce(&mut ClipParams)) {
        let mut params = ClipParams::expected(&CompositionConfig::default());
        f(&mut params);
        self.with(|s| s.overrides.insert(index, params));
    }

    pub fn fail_render(&self, index: u32) {
        self.with(|s| s.fail_render.insert(index));
    }

    pub fn fail_copy(&self) {
        self.with(|s| s.fail_copy = true);
    }

    pub fn fail_reencode(&self) {
        self.with(|s| s.fail_reencode = true);
    }

    /// Make the stream-copy output longer than the clips by `skew`.
    pub fn skew_copy_duration(&self, skew: Duration) {
        self.with(|s| s.copy_skew = skew);
    }

    pub fn copy_calls(&self) -> usize {
        self.with(|s| s.copy_calls)
    }

    pub fn reencode_calls(&self) -> usize {
        self.with(|s| s.reencode_calls)
    }

    /// Inputs of the most recent concat call, in order.
    pub fn last_concat_inputs(&self) -> Vec<PathBuf> {
        self.with(|s| s.last_concat.clone())
    }

    pub fn rendered_specs(&self) -> Vec<ClipSpec> {
        self.with(|s| s.rendered.clone())
    }

    pub fn rendered_indices(&self) -> Vec<u32> {
        self.with(|s| s.rendered.iter().map(|c| c.index).collect())
    }

    fn join(&self, clips: &[PathBuf], output: &Path, skew: Duration) -> sc_core::Result<()> {
        let total = self.with(|s| {
            s.last_concat = clips.to_vec();
            clips
                .iter()
                .map(|c| s.durations.get(c).copied().unwrap_or_default())
                .sum::<Duration>()
        });
        self.with(|s| s.durations.insert(output.to_path_buf(), total + skew));
        if output.parent().is_some_and(Path::is_dir) {
            std::fs::write(output, b"fake media")?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaBackend for FakeBackend {
    async fn render_clip(&self, spec: &ClipSpec, profile: &CompositionConfig) -> sc_core::Result<()> {
        self.with(|s| {
            s.rendered.push(spec.clone());
            if s.fail_render.contains(&spec.index) {
                return Err(Error::tool("ffmpeg", format!("render of clip {} failed", spec.index)));
            }
            let params = s
                .overrides
                .get(&spec.index)
                .cloned()
                .unwrap_or_else(|| ClipParams::expected(profile));
            s.params.insert(spec.output.clone(), params);
            s.durations.insert(spec.output.clone(), spec.duration);
            Ok(())
        })
    }

    async fn probe_clip(&self, path: &Path) -> sc_core::Result<ClipParams> {
        self.with(|s| s.params.get(path).cloned())
            .ok_or_else(|| Error::Probe(format!("no such clip {}", path.display())))
    }

    async fn probe_duration(&self, path: &Path) -> sc_core::Result<Duration> {
        self.with(|s| s.durations.get(path).copied())
            .ok_or_else(|| Error::Probe(format!("no duration for {}", path.display())))
    }

    async fn concat_copy(&self, clips: &[PathBuf], output: &Path) -> sc_core::Result<()> {
        let (fail, skew) = self.with(|s| {
            s.copy_calls += 1;
            (s.fail_copy, s.copy_skew)
        });
        if fail {
            return Err(Error::tool("ffmpeg", "concat demuxer: non-monotonic DTS"));
        }
        self.join(clips, output, skew)
    }

    async fn concat_reencode(
        &self,
        clips: &[PathBuf],
        _profile: &CompositionConfig,
        output: &Path,
    ) -> sc_core::Result<()> {
        let fail = self.with(|s| {
            s.reencode_calls += 1;
            s.fail_reencode
        });
        if fail {
            return Err(Error::tool("ffmpeg", "concat filter: out of memory"));
        }
        self.join(clips, output, Duration::ZERO)
    }
}
