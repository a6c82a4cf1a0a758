//! Media backends used by the composition engine.
//!
//! [`MediaBackend`] is the seam between composition policy and the tool that
//! actually encodes. [`FfmpegBackend`] drives ffmpeg/ffprobe through
//! [`ToolCommand`]; tests substitute an in-memory fake.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sc_core::config::{AvatarMode, CompositionConfig};

use super::plan::{AvatarFit, ClipSpec};
use crate::command::ToolCommand;
use crate::probe::{probe_media, ClipParams};
use crate::tools::ToolRegistry;

/// Rendering a single clip should never take this long.
const CLIP_TIMEOUT: Duration = Duration::from_secs(600);
/// Re-encoding the whole video can.
const CONCAT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Operations the composition engine needs from a media toolchain.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Render one segment clip encoded with `profile`.
    async fn render_clip(&self, spec: &ClipSpec, profile: &CompositionConfig) -> sc_core::Result<()>;

    /// Read the stream parameters of a rendered clip.
    async fn probe_clip(&self, path: &Path) -> sc_core::Result<ClipParams>;

    /// Container duration of a media file.
    async fn probe_duration(&self, path: &Path) -> sc_core::Result<Duration>;

    /// Join clips without re-encoding.
    async fn concat_copy(&self, clips: &[PathBuf], output: &Path) -> sc_core::Result<()>;

    /// Join clips, normalizing and re-encoding every input with `profile`.
    async fn concat_reencode(
        &self,
        clips: &[PathBuf],
        profile: &CompositionConfig,
        output: &Path,
    ) -> sc_core::Result<()>;
}

/// [`MediaBackend`] backed by the ffmpeg and ffprobe executables.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegBackend {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    /// Build from a discovered registry; both tools are required.
    pub fn from_registry(tools: &ToolRegistry) -> sc_core::Result<Self> {
        Ok(Self {
            ffmpeg: tools.require("ffmpeg")?.path.clone(),
            ffprobe: tools.require("ffprobe")?.path.clone(),
        })
    }

    fn ffmpeg(&self) -> ToolCommand {
        ToolCommand::new(self.ffmpeg.clone())
    }
}

#[async_trait]
impl MediaBackend for FfmpegBackend {
    async fn render_clip(&self, spec: &ClipSpec, profile: &CompositionConfig) -> sc_core::Result<()> {
        tracing::debug!(
            "render clip {} ({:.3}s, avatar: {})",
            spec.index,
            spec.duration.as_secs_f64(),
            spec.avatar.is_some()
        );
        let mut cmd = self.ffmpeg();
        cmd.args(clip_args(spec, profile)).timeout(CLIP_TIMEOUT);
        cmd.execute().await?;
        Ok(())
    }

    async fn probe_clip(&self, path: &Path) -> sc_core::Result<ClipParams> {
        probe_media(&self.ffprobe, path, None).await?.clip_params()
    }

    async fn probe_duration(&self, path: &Path) -> sc_core::Result<Duration> {
        probe_media(&self.ffprobe, path, None).await?.require_duration()
    }

    async fn concat_copy(&self, clips: &[PathBuf], output: &Path) -> sc_core::Result<()> {
        let list_path = output.with_extension("concat.txt");
        tokio::fs::write(&list_path, concat_list(clips)).await?;

        let mut cmd = self.ffmpeg();
        cmd.args(["-y", "-hide_banner", "-f", "concat", "-safe", "0", "-i"])
            .arg(list_path.to_string_lossy())
            .args(["-c", "copy", "-movflags", "+faststart"])
            .arg(output.to_string_lossy())
            .timeout(CONCAT_TIMEOUT);
        let result = cmd.execute().await;
        let _ = tokio::fs::remove_file(&list_path).await;
        result?;
        Ok(())
    }

    async fn concat_reencode(
        &self,
        clips: &[PathBuf],
        profile: &CompositionConfig,
        output: &Path,
    ) -> sc_core::Result<()> {
        let mut cmd = self.ffmpeg();
        cmd.args(reencode_args(clips, profile, output))
            .timeout(CONCAT_TIMEOUT);
        cmd.execute().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Argument builders
// ---------------------------------------------------------------------------

fn secs(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

fn channel_layout(channels: u32) -> String {
    match channels {
        1 => "mono".into(),
        2 => "stereo".into(),
        n => format!("{n}c"),
    }
}

/// Scale into the frame keeping aspect, pad the rest, fix SAR and rate.
fn fit_frame(p: &CompositionConfig) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps}",
        w = p.width,
        h = p.height,
        fps = p.fps
    )
}

fn normalize_audio(p: &CompositionConfig) -> String {
    format!(
        "aresample={},aformat=sample_fmts=fltp:channel_layouts={}",
        p.sample_rate,
        channel_layout(p.channels)
    )
}

fn hold_filter(fit: AvatarFit) -> String {
    match fit {
        AvatarFit::HoldLastFrame { gap } => {
            format!(",tpad=stop_mode=clone:stop_duration={}", secs(gap))
        }
        AvatarFit::Matched | AvatarFit::Truncate { .. } => String::new(),
    }
}

fn encode_args(p: &CompositionConfig) -> Vec<String> {
    vec![
        "-c:v".into(),
        p.video_codec.clone(),
        "-preset".into(),
        p.preset.clone(),
        "-pix_fmt".into(),
        p.pix_fmt.clone(),
        "-r".into(),
        p.fps.to_string(),
        "-c:a".into(),
        p.audio_codec.clone(),
        "-b:a".into(),
        p.audio_bitrate.clone(),
        "-ar".into(),
        p.sample_rate.to_string(),
        "-ac".into(),
        p.channels.to_string(),
    ]
}

/// ffmpeg arguments rendering one segment clip.
///
/// The visual is looped as a still; audio is padded with silence and the
/// whole clip is cut at exactly the audio duration, so neither a short
/// avatar nor a short audio encode can make the clip shorter than planned.
pub(crate) fn clip_args(spec: &ClipSpec, p: &CompositionConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into()];
    let fps = p.fps.to_string();

    let full_frame_avatar = spec
        .avatar
        .as_ref()
        .filter(|_| p.avatar.mode == AvatarMode::FullFrame);

    let graph = if let Some(avatar) = full_frame_avatar {
        // Inputs: 0 audio, 1 avatar.
        args.extend(["-i".into(), spec.audio.to_string_lossy().to_string()]);
        args.extend(["-i".into(), avatar.path.to_string_lossy().to_string()]);
        format!(
            "[1:v]{fit}{hold},format={pix}[v];[0:a]{audio},apad[a]",
            fit = fit_frame(p),
            hold = hold_filter(avatar.fit),
            pix = p.pix_fmt,
            audio = normalize_audio(p),
        )
    } else {
        // Inputs: 0 still visual, 1 audio, optional 2 avatar.
        args.extend(["-loop".into(), "1".into(), "-framerate".into(), fps.clone()]);
        args.extend(["-i".into(), spec.visual.to_string_lossy().to_string()]);
        args.extend(["-i".into(), spec.audio.to_string_lossy().to_string()]);
        match &spec.avatar {
            Some(avatar) => {
                args.extend(["-i".into(), avatar.path.to_string_lossy().to_string()]);
                let size = p.avatar.size;
                let x = p.width.saturating_sub(size + p.avatar.margin);
                let y = p.height.saturating_sub(size + p.avatar.margin);
                format!(
                    "[0:v]{fit}[bg];[2:v]scale={size}:{size},setsar=1,fps={fps}{hold}[av];\
                     [bg][av]overlay={x}:{y}:eof_action=repeat,format={pix}[v];[1:a]{audio},apad[a]",
                    fit = fit_frame(p),
                    hold = hold_filter(avatar.fit),
                    pix = p.pix_fmt,
                    audio = normalize_audio(p),
                )
            }
            None => format!(
                "[0:v]{fit},format={pix}[v];[1:a]{audio},apad[a]",
                fit = fit_frame(p),
                pix = p.pix_fmt,
                audio = normalize_audio(p),
            ),
        }
    };

    args.extend(["-filter_complex".into(), graph]);
    args.extend(["-map".into(), "[v]".into(), "-map".into(), "[a]".into()]);
    args.extend(encode_args(p));
    args.extend(["-t".into(), secs(spec.duration)]);
    args.extend(["-movflags".into(), "+faststart".into()]);
    args.push(spec.output.to_string_lossy().to_string());
    args
}

/// Concat demuxer list file body.
pub(crate) fn concat_list(clips: &[PathBuf]) -> String {
    clips
        .iter()
        .map(|c| format!("file '{}'\n", c.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

/// ffmpeg arguments for the normalize-then-concat re-encode.
pub(crate) fn reencode_args(clips: &[PathBuf], p: &CompositionConfig, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into()];
    for clip in clips {
        args.extend(["-i".into(), clip.to_string_lossy().to_string()]);
    }

    let mut graph = String::new();
    let mut pads = String::new();
    for i in 0..clips.len() {
        graph.push_str(&format!(
            "[{i}:v]{fit},format={pix}[v{i}];[{i}:a]{audio}[a{i}];",
            fit = fit_frame(p),
            pix = p.pix_fmt,
            audio = normalize_audio(p),
        ));
        pads.push_str(&format!("[v{i}][a{i}]"));
    }
    graph.push_str(&format!("{pads}concat=n={}:v=1:a=1[v][a]", clips.len()));

    args.extend(["-filter_complex".into(), graph]);
    args.extend(["-map".into(), "[v]".into(), "-map".into(), "[a]".into()]);
    args.extend(encode_args(p));
    args.extend(["-movflags".into(), "+faststart".into()]);
    args.push(output.to_string_lossy().to_string());
    args
}
