//! ffprobe-based media inspection.
//!
//! Shells out to `ffprobe -v quiet -print_format json -show_format -show_streams`
//! and maps the JSON output into a [`MediaProbe`]. Composition uses the
//! result to read clip durations and to check that every clip shares the
//! same stream parameters before taking the stream-copy concat path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sc_core::config::CompositionConfig;
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;

/// Frame rates closer than this are considered equal.
const FRAME_RATE_EPSILON: f64 = 0.01;

/// Stream parameters that must agree across clips for a stream-copy concat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub video_codec: String,
    pub pix_fmt: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u32,
}

impl ClipParams {
    /// Parameters a clip rendered with `profile` is expected to carry.
    pub fn expected(profile: &CompositionConfig) -> Self {
        Self {
            width: profile.width,
            height: profile.height,
            frame_rate: f64::from(profile.fps),
            video_codec: codec_name_for_encoder(&profile.video_codec),
            pix_fmt: profile.pix_fmt.clone(),
            audio_codec: codec_name_for_encoder(&profile.audio_codec),
            sample_rate: profile.sample_rate,
            channels: profile.channels,
        }
    }

    /// Describe the first parameter that differs from `other`, if any.
    pub fn mismatch(&self, other: &ClipParams) -> Option<String> {
        if (self.width, self.height) != (other.width, other.height) {
            return Some(format!(
                "resolution {}x{} vs {}x{}",
                self.width, self.height, other.width, other.height
            ));
        }
        if (self.frame_rate - other.frame_rate).abs() > FRAME_RATE_EPSILON {
            return Some(format!(
                "frame rate {:.3} vs {:.3}",
                self.frame_rate, other.frame_rate
            ));
        }
        if self.video_codec != other.video_codec {
            return Some(format!("video codec {} vs {}", self.video_codec, other.video_codec));
        }
        if self.pix_fmt != other.pix_fmt {
            return Some(format!("pixel format {} vs {}", self.pix_fmt, other.pix_fmt));
        }
        if self.audio_codec != other.audio_codec {
            return Some(format!("audio codec {} vs {}", self.audio_codec, other.audio_codec));
        }
        if self.sample_rate != other.sample_rate {
            return Some(format!("sample rate {} vs {}", self.sample_rate, other.sample_rate));
        }
        if self.channels != other.channels {
            return Some(format!("channels {} vs {}", self.channels, other.channels));
        }
        None
    }
}

impl std::fmt::Display for ClipParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}@{:.2} {}/{} {}/{}Hz/{}ch",
            self.width,
            self.height,
            self.frame_rate,
            self.video_codec,
            self.pix_fmt,
            self.audio_codec,
            self.sample_rate,
            self.channels
        )
    }
}

/// Map an ffmpeg encoder name to the codec name ffprobe reports.
fn codec_name_for_encoder(encoder: &str) -> String {
    match encoder {
        "libx264" | "h264_nvenc" | "h264_vaapi" | "h264_videotoolbox" => "h264".into(),
        "libx265" | "hevc_nvenc" | "hevc_vaapi" => "hevc".into(),
        "libvpx-vp9" => "vp9".into(),
        "libopus" => "opus".into(),
        "libmp3lame" => "mp3".into(),
        other => other.into(),
    }
}

/// Video stream details reported by ffprobe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStream {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub pix_fmt: Option<String>,
}

/// Audio stream details reported by ffprobe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStream {
    pub codec: String,
    pub sample_rate: Option<u32>,
    pub channels: u32,
}

/// Result of probing a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProbe {
    pub path: PathBuf,
    pub duration: Option<Duration>,
    pub video: Option<VideoStream>,
    pub audio: Option<AudioStream>,
}

impl MediaProbe {
    /// Container duration, or a probe error when ffprobe reported none.
    pub fn require_duration(&self) -> sc_core::Result<Duration> {
        self.duration.ok_or_else(|| {
            sc_core::Error::Probe(format!("no duration reported for {}", self.path.display()))
        })
    }

    /// Clip parameters; requires one video and one audio stream.
    pub fn clip_params(&self) -> sc_core::Result<ClipParams> {
        let video = self.video.as_ref().ok_or_else(|| {
            sc_core::Error::Probe(format!("no video stream in {}", self.path.display()))
        })?;
        let audio = self.audio.as_ref().ok_or_else(|| {
            sc_core::Error::Probe(format!("no audio stream in {}", self.path.display()))
        })?;
        Ok(ClipParams {
            width: video.width,
            height: video.height,
            frame_rate: video.frame_rate.unwrap_or(0.0),
            video_codec: video.codec.clone(),
            pix_fmt: video.pix_fmt.clone().unwrap_or_default(),
            audio_codec: audio.codec.clone(),
            sample_rate: audio.sample_rate.unwrap_or(0),
            channels: audio.channels,
        })
    }
}

/// Probe `path` with the ffprobe binary at `ffprobe`.
pub async fn probe_media(
    ffprobe: &Path,
    path: &Path,
    cancellation: Option<CancellationToken>,
) -> sc_core::Result<MediaProbe> {
    let mut cmd = ToolCommand::new(ffprobe.to_path_buf());
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ]);
    cmd.arg(path.to_string_lossy().as_ref());
    cmd.timeout(Duration::from_secs(60));
    if let Some(token) = cancellation {
        cmd.cancellation(token);
    }

    let output = cmd.execute().await?;
    parse_ffprobe_json(path, &output.stdout)
}

/// Parse the JSON document printed by ffprobe.
pub fn parse_ffprobe_json(path: &Path, json: &str) -> sc_core::Result<MediaProbe> {
    let ff: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| sc_core::Error::Probe(format!("ffprobe JSON parse error: {e}")))?;
    Ok(parse_ffprobe_output(path, ff))
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    pix_fmt: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    duration: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_ffprobe_output(path: &Path, output: FfprobeOutput) -> MediaProbe {
    let mut duration = output.format.duration.as_deref().and_then(parse_seconds);

    let mut video = None;
    let mut audio = None;

    for stream in output.streams {
        match stream.codec_type.as_deref().unwrap_or("") {
            "video" if video.is_none() => {
                let frame_rate = stream
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));
                video = Some(VideoStream {
                    codec: stream.codec_name.unwrap_or_default(),
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    frame_rate,
                    pix_fmt: stream.pix_fmt,
                });
            }
            "audio" if audio.is_none() => {
                if duration.is_none() {
                    duration = stream.duration.as_deref().and_then(parse_seconds);
                }
                audio = Some(AudioStream {
                    codec: stream.codec_name.unwrap_or_default(),
                    sample_rate: stream.sample_rate.and_then(|s| s.parse().ok()),
                    channels: stream.channels.unwrap_or(2),
                });
            }
            _ => {}
        }
    }

    MediaProbe {
        path: path.to_path_buf(),
        duration,
        video,
        audio,
    }
}

fn parse_seconds(s: &str) -> Option<Duration> {
    let secs: f64 = s.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn parse_frame_rate(rate_str: &str) -> Option<f64> {
    let parts: Vec<&str> = rate_str.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den != 0.0 {
            return Some(num / den);
        }
        return None;
    }
    rate_str.parse().ok()
}
