//! Remote JSON endpoint capability.
//!
//! The request is POSTed as JSON. The reply carries the result inline:
//!
//! ```json
//! { "units": [...] }                                  // understand
//! { "script": "..." }                                 // generate_script
//! { "data": "<base64>", "format": "png" }             // generate_visual
//! { "data": "<base64>", "format": "mp3", "duration": 4.2 }  // speech, avatar
//! ```
//!
//! Binary payloads are written under the stage directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use sc_core::{AudioArtifact, AvatarArtifact, CapabilityFailure, ContentUnit, Stage};
use serde::Deserialize;

use crate::capability::{Capability, CapabilityRequest, CapabilityResponse, InvokeContext};

/// Connection timeout; the invocation deadline bounds the whole exchange.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
struct HttpReply {
    #[serde(default)]
    units: Option<Vec<ContentUnit>>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    format: Option<String>,
    /// Seconds.
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HttpCapability {
    name: String,
    stage: Stage,
    url: String,
    headers: BTreeMap<String, String>,
    client: Client,
    ffprobe: Option<PathBuf>,
}

impl HttpCapability {
    pub fn new(name: impl Into<String>, stage: Stage, url: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });

        Self {
            name: name.into(),
            stage,
            url: url.into(),
            headers: BTreeMap::new(),
            client,
            ffprobe: None,
        }
    }

    /// Builder: extra request headers (API keys and the like).
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Builder: ffprobe binary used when a reply omits `duration`.
    pub fn with_ffprobe(mut self, ffprobe: Option<PathBuf>) -> Self {
        self.ffprobe = ffprobe;
        self
    }

    async fn post(
        &self,
        request: &CapabilityRequest,
        ctx: &InvokeContext,
    ) -> Result<HttpReply, CapabilityFailure> {
        let mut builder = self.client.post(&self.url).timeout(ctx.timeout).json(request);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                CapabilityFailure::permanent(format!("invalid request to {}: {e}", self.url))
            } else {
                CapabilityFailure::transient(format!("request to {} failed: {e}", self.url))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let cause = format!("{} returned {status}: {}", self.url, body.trim());
            return Err(if is_transient_status(status) {
                CapabilityFailure::transient(cause)
            } else {
                CapabilityFailure::permanent(cause)
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CapabilityFailure::transient(format!("reading reply failed: {e}")))?;
        serde_json::from_slice(&body)
            .map_err(|e| CapabilityFailure::permanent(format!("malformed reply: {e}")))
    }

    async fn write_payload(
        &self,
        reply: &HttpReply,
        index: Option<u32>,
        default_ext: &str,
        ctx: &InvokeContext,
    ) -> Result<PathBuf, CapabilityFailure> {
        let data = reply
            .data
            .as_deref()
            .ok_or_else(|| CapabilityFailure::permanent("reply has no data"))?;
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| CapabilityFailure::permanent(format!("reply data is not base64: {e}")))?;
        if bytes.is_empty() {
            return Err(CapabilityFailure::permanent("reply data is empty"));
        }

        let ext = reply
            .format
            .as_deref()
            .map(sanitize_extension)
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| default_ext.to_string());
        let path = ctx.artifact_path(index, &self.name, &ext);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CapabilityFailure::permanent(format!("cannot write {}: {e}", path.display())))?;
        Ok(path)
    }

    async fn duration(
        &self,
        reply: &HttpReply,
        path: &Path,
        ctx: &InvokeContext,
    ) -> Result<Duration, CapabilityFailure> {
        if let Some(secs) = reply.duration {
            return Duration::try_from_secs_f64(secs)
                .map_err(|e| CapabilityFailure::permanent(format!("invalid duration {secs}: {e}")));
        }
        let ffprobe = self.ffprobe.as_deref().ok_or_else(|| {
            CapabilityFailure::permanent("reply has no duration and ffprobe is not available")
        })?;
        sc_av::probe_media(ffprobe, path, Some(ctx.cancellation.clone()))
            .await
            .and_then(|probe| probe.require_duration())
            .map_err(|e| CapabilityFailure::permanent(e.to_string()))
    }
}

/// Server-side and rate-limit statuses are worth retrying.
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn sanitize_extension(ext: &str) -> String {
    ext.trim()
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

#[async_trait]
impl Capability for HttpCapability {
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

        let reply = self.post(&request, ctx).await?;
        let index = request.index();

        match self.stage {
            Stage::Understand => reply
                .units
                .map(CapabilityResponse::Outline)
                .ok_or_else(|| CapabilityFailure::permanent("reply has no units")),
            Stage::GenerateScript => reply
                .script
                .map(CapabilityResponse::Script)
                .ok_or_else(|| CapabilityFailure::permanent("reply has no script")),
            Stage::GenerateVisual => {
                let path = self.write_payload(&reply, index, "png", ctx).await?;
                let visual = sc_av::visual_artifact(path)
                    .map_err(|e| CapabilityFailure::permanent(e.to_string()))?;
                Ok(CapabilityResponse::Visual(visual))
            }
            Stage::SynthesizeSpeech => {
                let path = self.write_payload(&reply, index, "mp3", ctx).await?;
                let duration = self.duration(&reply, &path, ctx).await?;
                Ok(CapabilityResponse::Speech(AudioArtifact { path, duration }))
            }
            Stage::SyncAvatar => {
                let path = self.write_payload(&reply, index, "mp4", ctx).await?;
                let duration = self.duration(&reply, &path, ctx).await?;
                Ok(CapabilityResponse::Avatar(AvatarArtifact { path, duration }))
            }
            other => Err(CapabilityFailure::permanent(format!(
                "{other} is not a capability stage"
            ))),
        }
    }
}
