//! Themed slide rendered with ffmpeg's `color` source and `drawtext`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sc_av::{CommandError, ToolCommand};
use sc_core::{CapabilityFailure, ContentUnit, Stage};

use crate::capability::{Capability, CapabilityRequest, CapabilityResponse, InvokeContext};

/// Slide colours as ffmpeg hex strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub background: &'static str,
    pub primary: &'static str,
    pub accent: &'static str,
    pub text: &'static str,
}

pub const THEMES: &[(&str, Palette)] = &[
    (
        "modern_dark",
        Palette {
            background: "0x0F172A",
            primary: "0x6366F1",
            accent: "0xA855F7",
            text: "0xF8FAFC",
        },
    ),
    (
        "cyber_neon",
        Palette {
            background: "0x050505",
            primary: "0x00FFFF",
            accent: "0xFF00FF",
            text: "0xFFFFFF",
        },
    ),
    (
        "elegant_light",
        Palette {
            background: "0xFFFFFF",
            primary: "0x1E293B",
            accent: "0x6366F1",
            text: "0x0F172A",
        },
    ),
    (
        "corporate_pro",
        Palette {
            background: "0xF0F4F8",
            primary: "0x1A365D",
            accent: "0x2B6CB0",
            text: "0x2D3748",
        },
    ),
];

/// Palette for `theme`; unknown themes get `modern_dark`.
pub fn palette(theme: &str) -> Palette {
    let wanted = theme.trim().to_lowercase();
    THEMES
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, p)| *p)
        .unwrap_or_else(|| {
            tracing::debug!("unknown theme '{theme}', using modern_dark");
            THEMES[0].1
        })
}

/// Characters per body line before wrapping.
const WRAP_COLUMNS: usize = 56;

#[derive(Debug, Clone)]
pub struct TitleCardCapability {
    name: String,
    ffmpeg: PathBuf,
    font_file: Option<PathBuf>,
}

impl TitleCardCapability {
    pub fn new(name: impl Into<String>, ffmpeg: PathBuf, font_file: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            ffmpeg,
            font_file,
        }
    }

    /// Arguments rendering one frame to `output`.
    pub fn render_args(
        &self,
        title_file: &Path,
        body_file: &Path,
        theme: &str,
        width: u32,
        height: u32,
        output: &Path,
    ) -> Vec<String> {
        let p = palette(theme);
        let scale = f64::from(height) / 1080.0;
        let px = |v: f64| (v * scale).round() as u32;

        let font = self
            .font_file
            .as_deref()
            .map(|f| format!("fontfile='{}':", escape_filter_path(f)))
            .unwrap_or_default();

        let filter = [
            format!(
                "drawbox=x={}:y={}:w={}:h={}:color={}:t=fill",
                px(100.0),
                px(190.0),
                px(150.0),
                px(10.0),
                p.primary
            ),
            format!(
                "drawbox=x={}:y=0:w={}:h={height}:color={}@0.15:t=fill",
                width.saturating_sub(px(400.0)),
                px(400.0),
                p.accent
            ),
            format!(
                "drawtext={font}textfile='{}':x={}:y={}:fontsize={}:fontcolor={}",
                escape_filter_path(title_file),
                px(100.0),
                px(80.0),
                px(72.0),
                p.text
            ),
            format!(
                "drawtext={font}textfile='{}':x={}:y={}:fontsize={}:line_spacing={}:fontcolor={}",
                escape_filter_path(body_file),
                px(100.0),
                px(250.0),
                px(44.0),
                px(22.0),
                p.text
            ),
        ]
        .join(",");

        vec![
            "-y".into(),
            "-hide_banner".into(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("color=c={}:s={width}x{height}:d=1", p.background),
            "-vf".into(),
            filter,
            "-frames:v".into(),
            "1".into(),
            output.to_string_lossy().to_string(),
        ]
    }
}

/// Body text: one bullet per key point, wrapped.
pub fn body_text(unit: &ContentUnit) -> String {
    unit.key_points
        .iter()
        .map(|point| {
            let lines = wrap(point.trim(), WRAP_COLUMNS);
            let mut out = String::new();
            for (i, line) in lines.iter().enumerate() {
                out.push_str(if i == 0 { "- " } else { "  " });
                out.push_str(line);
                out.push('\n');
            }
            out
        })
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn wrap(text: &str, columns: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > columns {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Escape a path for use inside a single-quoted filter option.
fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "'\\''")
}

fn classify(err: CommandError) -> CapabilityFailure {
    match err {
        CommandError::TimedOut { .. } | CommandError::Cancelled { .. } => {
            CapabilityFailure::transient(err.to_string())
        }
        other => CapabilityFailure::permanent(other.to_string()),
    }
}

#[async_trait]
impl Capability for TitleCardCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        Stage::GenerateVisual
    }

    async fn invoke(
        &self,
        request: CapabilityRequest,
        ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        let (unit, index, theme, width, height) = match request {
            CapabilityRequest::Visual {
                unit,
                index,
                theme,
                width,
                height,
            } => (unit, index, theme, width, height),
            other => {
                return Err(CapabilityFailure::permanent(format!(
                    "title_card cannot serve {}",
                    other.stage()
                )))
            }
        };

        let title_file = ctx.artifact_path(Some(index), &self.name, "title.txt");
        let body_file = ctx.artifact_path(Some(index), &self.name, "body.txt");
        let output = ctx.artifact_path(Some(index), &self.name, "png");

        tokio::fs::write(&title_file, unit.title.trim())
            .await
            .map_err(|e| CapabilityFailure::permanent(format!("cannot write slide text: {e}")))?;
        tokio::fs::write(&body_file, body_text(&unit))
            .await
            .map_err(|e| CapabilityFailure::permanent(format!("cannot write slide text: {e}")))?;

        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        cmd.args(self.render_args(&title_file, &body_file, &theme, width, height, &output))
            .timeout(ctx.timeout)
            .cancellation(ctx.cancellation.clone());
        cmd.execute().await.map_err(classify)?;

        let visual = sc_av::visual_artifact(&output)
            .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
        Ok(CapabilityResponse::Visual(visual))
    }
}
