//! The fixed sequence of pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// One step of the document-to-video pipeline.
///
/// Variants are declared in execution order, so the derived `Ord` matches
/// the order in which the driver runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Normalize the inbound document payload.
    Ingest,
    /// Split the document into ordered content units (fixes segment count).
    #[serde(alias = "content", alias = "content_understanding")]
    Understand,
    /// Produce one slide image per segment.
    #[serde(alias = "slides", alias = "slide_generation")]
    GenerateVisual,
    /// Produce the narration script per segment.
    #[serde(alias = "explanation", alias = "script")]
    GenerateScript,
    /// Turn the narration script into audio.
    #[serde(alias = "tts", alias = "speech")]
    SynthesizeSpeech,
    /// Lip-sync a presenter face to the audio. Optional.
    #[serde(alias = "avatar", alias = "avatar_sync")]
    SyncAvatar,
    /// Assemble all segments into the output file.
    Compose,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Stage; 7] = [
        Stage::Ingest,
        Stage::Understand,
        Stage::GenerateVisual,
        Stage::GenerateScript,
        Stage::SynthesizeSpeech,
        Stage::SyncAvatar,
        Stage::Compose,
    ];

    /// Stages satisfied by pluggable capabilities.
    pub const CAPABILITY_STAGES: [Stage; 5] = [
        Stage::Understand,
        Stage::GenerateVisual,
        Stage::GenerateScript,
        Stage::SynthesizeSpeech,
        Stage::SyncAvatar,
    ];

    /// Canonical snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Understand => "understand",
            Stage::GenerateVisual => "generate_visual",
            Stage::GenerateScript => "generate_script",
            Stage::SynthesizeSpeech => "synthesize_speech",
            Stage::SyncAvatar => "sync_avatar",
            Stage::Compose => "compose",
        }
    }

    /// Position of this stage in [`Stage::ALL`].
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// A failure of a mandatory stage drops the segment; losing every
    /// segment fails the run.
    pub fn is_mandatory(self) -> bool {
        self != Stage::SyncAvatar
    }

    /// Whether the stage is executed through the provider router.
    pub fn uses_capabilities(self) -> bool {
        Self::CAPABILITY_STAGES.contains(&self)
    }

    /// Subdirectory name inside a run workspace.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Understand => "understand",
            Stage::GenerateVisual => "visual",
            Stage::GenerateScript => "script",
            Stage::SynthesizeSpeech => "speech",
            Stage::SyncAvatar => "avatar",
            Stage::Compose => "compose",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "ingest" => Ok(Stage::Ingest),
            "understand" | "content" | "content_understanding" => Ok(Stage::Understand),
            "generate_visual" | "slides" | "slide_generation" => Ok(Stage::GenerateVisual),
            "generate_script" | "explanation" | "script" => Ok(Stage::GenerateScript),
            "synthesize_speech" | "tts" | "speech" => Ok(Stage::SynthesizeSpeech),
            "sync_avatar" | "avatar" | "avatar_sync" => Ok(Stage::SyncAvatar),
            "compose" => Ok(Stage::Compose),
            other => Err(Error::Validation(format!("unknown stage: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn all_is_in_ordinal_order() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.ordinal(), i);
        }
        let mut sorted = Stage::ALL;
        sorted.sort();
        assert_eq!(sorted, Stage::ALL);
    }

    #[test]
    fn only_avatar_is_optional() {
        let optional: Vec<Stage> = Stage::ALL
            .into_iter()
            .filter(|s| !s.is_mandatory())
            .collect();
        assert_eq!(optional, vec![Stage::SyncAvatar]);
    }

    #[test]
    fn parse_aliases() {
        assert_eq!("tts".parse::<Stage>().unwrap(), Stage::SynthesizeSpeech);
        assert_eq!("Slides".parse::<Stage>().unwrap(), Stage::GenerateVisual);
        assert_eq!("sync-avatar".parse::<Stage>().unwrap(), Stage::SyncAvatar);
        assert!("render".parse::<Stage>().is_err());
    }

    #[test]
    fn display_roundtrips_through_from_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.to_string().parse::<Stage>().unwrap(), stage);
        }
    }

    #[test]
    fn usable_as_json_map_key() {
        let json = r#"{"tts": ["a"], "understand": ["b", "c"]}"#;
        let map: BTreeMap<Stage, Vec<String>> = serde_json::from_str(json).unwrap();
        assert_eq!(map[&Stage::SynthesizeSpeech], vec!["a"]);
        assert_eq!(map[&Stage::Understand].len(), 2);
    }
}
