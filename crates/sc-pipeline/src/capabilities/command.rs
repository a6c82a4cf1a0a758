//! External program capability with `{placeholder}` argument templating.
//!
//! The request is also written to the child's stdin as JSON. File artifacts
//! are expected at `{output}`; text results may be printed to stdout instead.
//!
//! Supported placeholders: `{input}`, `{output}`, `{text}`, `{text_file}`,
//! `{voice}`, `{audio}`, `{face}`, `{theme}`, `{width}`, `{height}`,
//! `{index}`. Unused ones expand to an empty string.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sc_av::{CommandError, ToolCommand};
use sc_core::{AudioArtifact, AvatarArtifact, CapabilityFailure, ContentUnit, Stage};

use crate::capability::{Capability, CapabilityRequest, CapabilityResponse, InvokeContext};

#[derive(Debug, Clone)]
pub struct CommandCapability {
    name: String,
    stage: Stage,
    program: PathBuf,
    args: Vec<String>,
    output_extension: Option<String>,
    /// Needed to time audio and avatar artifacts.
    ffprobe: Option<PathBuf>,
}

impl CommandCapability {
    pub fn new(name: impl Into<String>, stage: Stage, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            stage,
            program: program.into(),
            args,
            output_extension: None,
            ffprobe: None,
        }
    }

    /// Builder: extension of the file written to `{output}`.
    pub fn with_output_extension(mut self, ext: Option<String>) -> Self {
        self.output_extension = ext;
        self
    }

    /// Builder: ffprobe binary used to measure produced media.
    pub fn with_ffprobe(mut self, ffprobe: Option<PathBuf>) -> Self {
        self.ffprobe = ffprobe;
        self
    }

    fn extension(&self) -> &str {
        if let Some(ext) = self.output_extension.as_deref() {
            return ext.trim_start_matches('.');
        }
        match self.stage {
            Stage::Understand => "json",
            Stage::GenerateVisual => "png",
            Stage::GenerateScript => "txt",
            Stage::SynthesizeSpeech => "wav",
            _ => "mp4",
        }
    }

    /// Substitute placeholders in the configured arguments.
    ///
    /// Each argument is scanned once, so substituted values are never
    /// expanded again. Unknown `{names}` are kept verbatim.
    pub fn expand_args(&self, vars: &BTreeMap<&'static str, String>) -> Vec<String> {
        self.args.iter().map(|arg| expand(arg, vars)).collect()
    }

    async fn read_response(
        &self,
        output: &Path,
        stdout: &str,
        ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        let written = tokio::fs::try_exists(output).await.unwrap_or(false);

        match self.stage {
            Stage::Understand => {
                let raw = if written {
                    read_text(output).await?
                } else {
                    stdout.to_string()
                };
                let units: Vec<ContentUnit> = serde_json::from_str(raw.trim())
                    .map_err(|e| CapabilityFailure::permanent(format!("malformed outline: {e}")))?;
                Ok(CapabilityResponse::Outline(units))
            }
            Stage::GenerateScript => {
                let script = if written {
                    read_text(output).await?
                } else {
                    stdout.to_string()
                };
                Ok(CapabilityResponse::Script(script.trim().to_string()))
            }
            Stage::GenerateVisual => {
                require_written(written, output)?;
                let visual = sc_av::visual_artifact(output)
                    .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
                Ok(CapabilityResponse::Visual(visual))
            }
            Stage::SynthesizeSpeech => {
                require_written(written, output)?;
                let duration = self.measure(output, ctx).await?;
                Ok(CapabilityResponse::Speech(AudioArtifact {
                    path: output.to_path_buf(),
                    duration,
                }))
            }
            Stage::SyncAvatar => {
                require_written(written, output)?;
                let duration = self.measure(output, ctx).await?;
                Ok(CapabilityResponse::Avatar(AvatarArtifact {
                    path: output.to_path_buf(),
                    duration,
                }))
            }
            other => Err(CapabilityFailure::permanent(format!(
                "{other} is not a capability stage"
            ))),
        }
    }

    async fn measure(
        &self,
        path: &Path,
        ctx: &InvokeContext,
    ) -> Result<std::time::Duration, CapabilityFailure> {
        let ffprobe = self
            .ffprobe
            .as_deref()
            .ok_or_else(|| CapabilityFailure::permanent("ffprobe is not available"))?;
        sc_av::probe_media(ffprobe, path, Some(ctx.cancellation.clone()))
            .await
            .and_then(|probe| probe.require_duration())
            .map_err(|e| CapabilityFailure::permanent(e.to_string()))
    }
}

fn require_written(written: bool, output: &Path) -> Result<(), CapabilityFailure> {
    if written {
        Ok(())
    } else {
        Err(CapabilityFailure::permanent(format!(
            "program exited successfully but wrote nothing to {}",
            output.display()
        )))
    }
}

fn expand(template: &str, vars: &BTreeMap<&'static str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let value = tail
            .find('}')
            .and_then(|close| vars.get(&tail[1..close]).map(|value| (close, value)));
        match value {
            Some((close, value)) => {
                out.push_str(value);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

async fn read_text(path: &Path) -> Result<String, CapabilityFailure> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CapabilityFailure::permanent(format!("cannot read {}: {e}", path.display())))
}

/// Missing programs never start working on retry; crashes and timeouts may.
fn classify(err: CommandError) -> CapabilityFailure {
    match err {
        CommandError::Spawn { .. } => CapabilityFailure::permanent(err.to_string()),
        other => CapabilityFailure::transient(other.to_string()),
    }
}

#[async_trait]
impl Capability for CommandCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    async fn invoke(
        &self,
        request: CapabilityRequest,
        ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        if request.stage() != self.stage {
            return Err(CapabilityFailure::permanent(format!(
                "{} serves {}, not {}",
                self.name,
                self.stage,
                request.stage()
            )));
        }

        let index = request.index();
        let output = ctx.artifact_path(index, &self.name, self.extension());
        let text = request.text().unwrap_or_default();
        let text_file = ctx.artifact_path(index, &self.name, "in.txt");
        tokio::fs::write(&text_file, &text)
            .await
            .map_err(|e| CapabilityFailure::permanent(format!("cannot write input text: {e}")))?;

        let path_str = |p: &Path| p.to_string_lossy().to_string();
        let mut vars: BTreeMap<&'static str, String> = BTreeMap::new();
        vars.insert("output", path_str(&output));
        vars.insert("text_file", path_str(&text_file));
        vars.insert("text", text);
        vars.insert("index", index.map(|i| i.to_string()).unwrap_or_default());
        vars.insert("input", path_str(&text_file));
        for key in ["voice", "audio", "face", "theme", "width", "height"] {
            vars.insert(key, String::new());
        }

        match &request {
            CapabilityRequest::Speech { voice, .. } => {
                vars.insert("voice", voice.clone().unwrap_or_default());
            }
            CapabilityRequest::Avatar {
                audio, face_image, ..
            } => {
                vars.insert("audio", path_str(audio));
                vars.insert("face", path_str(face_image));
                vars.insert("input", path_str(audio));
            }
            CapabilityRequest::Visual {
                theme,
                width,
                height,
                ..
            } => {
                vars.insert("theme", theme.clone());
                vars.insert("width", width.to_string());
                vars.insert("height", height.to_string());
            }
            _ => {}
        }

        let stdin = serde_json::to_vec(&request)
            .map_err(|e| CapabilityFailure::permanent(format!("cannot encode request: {e}")))?;

        let args = self.expand_args(&vars);
        tracing::debug!("{}: {} {}", self.name, self.program.display(), args.join(" "));

        let mut cmd = ToolCommand::new(self.program.clone());
        cmd.args(args)
            .stdin(stdin)
            .timeout(ctx.timeout)
            .cancellation(ctx.cancellation.clone());
        let result = cmd.execute().await.map_err(classify)?;

        self.read_response(&output, &result.stdout, ctx).await
    }
}
