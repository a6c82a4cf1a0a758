//! Per-segment clip planning.
//!
//! The audio track is the timing master for every clip. An avatar video is
//! reconciled against it: within one frame it is used as-is, a shorter one
//! is frozen on its last frame, a longer one is cut at the audio's end.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sc_core::{Error, Segment};
use serde::{Deserialize, Serialize};

/// How an avatar clip is reconciled with its segment's audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fit", rename_all = "snake_case")]
pub enum AvatarFit {
    /// Durations agree within tolerance.
    Matched,
    /// Avatar is shorter; hold its last frame for `gap`.
    HoldLastFrame {
        #[serde(with = "sc_core::serde_duration")]
        gap: Duration,
    },
    /// Avatar is longer; drop the trailing `excess`.
    Truncate {
        #[serde(with = "sc_core::serde_duration")]
        excess: Duration,
    },
}

/// Decide how to fit an avatar of length `avatar` to audio of length `audio`.
pub fn plan_avatar(audio: Duration, avatar: Duration, tolerance: Duration) -> AvatarFit {
    if audio > avatar {
        let gap = audio - avatar;
        if gap > tolerance {
            return AvatarFit::HoldLastFrame { gap };
        }
    } else {
        let excess = avatar - audio;
        if excess > tolerance {
            return AvatarFit::Truncate { excess };
        }
    }
    AvatarFit::Matched
}

/// Avatar input of one clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarInput {
    pub path: PathBuf,
    pub fit: AvatarFit,
}

/// Everything needed to render one segment's clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSpec {
    pub index: u32,
    pub visual: PathBuf,
    pub audio: PathBuf,
    /// Exact length of the rendered clip.
    #[serde(with = "sc_core::serde_duration")]
    pub duration: Duration,
    pub avatar: Option<AvatarInput>,
    pub output: PathBuf,
}

impl ClipSpec {
    /// Plan the clip for `segment`, writing into `out_dir`.
    ///
    /// Fails when the segment lacks a visual or a timed audio artifact.
    pub fn for_segment(segment: &Segment, out_dir: &Path, tolerance: Duration) -> sc_core::Result<Self> {
        let visual = segment.visual.as_ref().ok_or_else(|| {
            Error::Validation(format!("segment {} has no visual artifact", segment.index))
        })?;
        let audio = segment
            .audio
            .as_ref()
            .filter(|a| !a.duration.is_zero())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "segment {} has no audio artifact with known duration",
                    segment.index
                ))
            })?;

        let avatar = segment.avatar.as_ref().map(|av| AvatarInput {
            path: av.path.clone(),
            fit: plan_avatar(audio.duration, av.duration, tolerance),
        });

        Ok(Self {
            index: segment.index,
            visual: visual.path.clone(),
            audio: audio.path.clone(),
            duration: audio.duration,
            avatar,
            output: out_dir.join(format!("{}.mp4", segment.file_stem())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_core::{AudioArtifact, AvatarArtifact, ContentUnit, VisualArtifact};

    const FRAME: Duration = Duration::from_millis(40);

    fn segment(index: u32, audio_secs: f64, avatar_secs: Option<f64>) -> Segment {
        let mut seg = Segment::new(
            index,
            ContentUnit {
                title: "t".into(),
                key_points: vec!["p".into()],
                ..Default::default()
            },
        );
        seg.visual = Some(VisualArtifact {
            path: PathBuf::from(format!("/w/visual/{index}.png")),
            width: 1920,
            height: 1080,
        });
        seg.audio = Some(AudioArtifact {
            path: PathBuf::from(format!("/w/speech/{index}.mp3")),
            duration: Duration::from_secs_f64(audio_secs),
        });
        seg.avatar = avatar_secs.map(|s| AvatarArtifact {
            path: PathBuf::from(format!("/w/avatar/{index}.mp4")),
            duration: Duration::from_secs_f64(s),
        });
        seg
    }

    #[test]
    fn shorter_avatar_holds_last_frame() {
        let fit = plan_avatar(Duration::from_secs(10), Duration::from_secs(8), FRAME);
        assert_eq!(
            fit,
            AvatarFit::HoldLastFrame {
                gap: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn longer_avatar_is_truncated() {
        let fit = plan_avatar(Duration::from_secs(5), Duration::from_secs(7), FRAME);
        assert_eq!(
            fit,
            AvatarFit::Truncate {
                excess: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn within_one_frame_is_matched() {
        let audio = Duration::from_secs(5);
        assert_eq!(plan_avatar(audio, audio - Duration::from_millis(30), FRAME), AvatarFit::Matched);
        assert_eq!(plan_avatar(audio, audio + Duration::from_millis(40), FRAME), AvatarFit::Matched);
        assert_eq!(plan_avatar(audio, audio, FRAME), AvatarFit::Matched);
    }

    #[test]
    fn clip_duration_is_audio_duration() {
        for avatar in [None, Some(8.0), Some(12.0)] {
            let spec = ClipSpec::for_segment(&segment(1, 10.0, avatar), Path::new("/w/compose"), FRAME)
                .unwrap();
            assert_eq!(spec.duration, Duration::from_secs(10));
        }
    }

    #[test]
    fn clip_output_named_by_index() {
        let spec = ClipSpec::for_segment(&segment(3, 4.0, None), Path::new("/w/compose"), FRAME).unwrap();
        assert_eq!(spec.output, PathBuf::from("/w/compose/segment_003.mp4"));
        assert!(spec.avatar.is_none());
    }

    #[test]
    fn segment_without_audio_is_rejected() {
        let mut seg = segment(0, 4.0, None);
        seg.audio = None;
        assert!(ClipSpec::for_segment(&seg, Path::new("/w"), FRAME).is_err());

        let mut seg = segment(0, 4.0, None);
        seg.audio.as_mut().unwrap().duration = Duration::ZERO;
        assert!(ClipSpec::for_segment(&seg, Path::new("/w"), FRAME).is_err());
    }
}
