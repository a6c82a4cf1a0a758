//! Run-scoped settings and the per-stage execution context.
//!
//! [`RunSettings`] is a snapshot taken from [`Config`] when a driver is built;
//! nothing downstream reads configuration or environment on its own.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sc_core::config::{CompositionConfig, Config, RetryConfig};
use sc_core::Stage;
use tokio_util::sync::CancellationToken;

use crate::capability::InvokeContext;

/// Settings a run needs, captured once from configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub retry: RetryConfig,
    /// Upper bound on concurrent capability invocations within a stage.
    pub max_concurrency: usize,
    /// Default invocation deadline.
    pub invoke_timeout: Duration,
    /// Per-capability deadline overrides.
    pub timeouts: BTreeMap<String, Duration>,
    pub composition: CompositionConfig,
    /// Voice used when the request does not name one.
    pub default_voice: Option<String>,
    /// Parent of the per-run working directories.
    pub work_root: PathBuf,
    /// Where composed outputs are written.
    pub output_dir: PathBuf,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        let timeouts = config
            .capabilities
            .iter()
            .filter_map(|(name, def)| {
                def.timeout_secs
                    .map(|secs| (name.clone(), Duration::from_secs(secs)))
            })
            .collect();

        Self {
            retry: config.pipeline.retry.clone(),
            max_concurrency: config.pipeline.max_concurrency.max(1),
            invoke_timeout: config.pipeline.invoke_timeout(),
            timeouts,
            composition: config.composition.clone(),
            default_voice: config.voice.clone(),
            work_root: config.pipeline.work_root(),
            output_dir: config.pipeline.output_dir.clone(),
        }
    }

    /// Deadline for one invocation of `capability`.
    pub fn timeout_for(&self, capability: &str) -> Duration {
        self.timeouts
            .get(capability)
            .copied()
            .unwrap_or(self.invoke_timeout)
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Context passed to the stage executor for one stage of one run.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stage: Stage,
    /// Directory holding this stage's artifacts.
    pub stage_dir: PathBuf,
    pub settings: Arc<RunSettings>,
    /// Cancelled when the run is aborted.
    pub cancellation: CancellationToken,
}

impl StageContext {
    pub fn new(stage: Stage, stage_dir: impl Into<PathBuf>, settings: Arc<RunSettings>) -> Self {
        Self {
            stage,
            stage_dir: stage_dir.into(),
            settings,
            cancellation: CancellationToken::new(),
        }
    }

    /// Builder: attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Context for one invocation of `capability`.
    pub fn invoke_context(&self, capability: &str) -> InvokeContext {
        InvokeContext::new(self.stage_dir.clone(), self.settings.timeout_for(capability))
            .with_cancellation(self.cancellation.clone())
    }
}
