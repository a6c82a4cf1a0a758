//! Provider routing: (provider, stage) to an ordered capability chain.
//!
//! The [`BindingTable`] is immutable process-wide configuration. A run calls
//! [`ProviderRouter::resolve`] once and keeps the returned [`Routes`]; later
//! changes to the table cannot affect a run in flight.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sc_core::config::Config;
use sc_core::{Error, Stage};

use crate::capability::Capability;

/// Named capabilities available to the router.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability; names must be unique.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> sc_core::Result<()> {
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            return Err(Error::Config(format!("capability '{name}' registered twice")));
        }
        self.capabilities.insert(name, capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.capabilities.keys()).finish()
    }
}

fn normalize_provider(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Ordered capability preferences per provider and per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
    providers: BTreeMap<String, BTreeMap<Stage, Vec<String>>>,
    defaults: BTreeMap<Stage, Vec<String>>,
}

impl BindingTable {
    /// Defaults served by the built-in capabilities.
    pub fn builtin_defaults() -> BTreeMap<Stage, Vec<String>> {
        BTreeMap::from([
            (Stage::Understand, vec!["outline".to_string()]),
            (Stage::GenerateVisual, vec!["title_card".to_string()]),
            (Stage::GenerateScript, vec!["narration".to_string()]),
            (Stage::SynthesizeSpeech, Vec::new()),
            (Stage::SyncAvatar, Vec::new()),
        ])
    }

    /// Empty table with the built-in defaults.
    pub fn new() -> Self {
        Self {
            providers: BTreeMap::new(),
            defaults: Self::builtin_defaults(),
        }
    }

    /// Table from configuration; configured defaults replace built-in ones
    /// stage by stage.
    pub fn from_config(config: &Config) -> Self {
        let mut table = Self::new();
        for (provider, stages) in &config.providers {
            for (stage, names) in stages {
                table = table.bind(provider, *stage, names.iter().map(String::as_str));
            }
        }
        for (stage, names) in &config.defaults {
            table = table.with_default(*stage, names.iter().map(String::as_str));
        }
        table
    }

    /// Builder: bind `provider` for `stage` to `names`, most preferred first.
    pub fn bind<'a>(
        mut self,
        provider: &str,
        stage: Stage,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        self.providers
            .entry(normalize_provider(provider))
            .or_default()
            .insert(stage, names.into_iter().map(str::to_string).collect());
        self
    }

    /// Builder: replace the default chain for `stage`.
    pub fn with_default<'a>(mut self, stage: Stage, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.defaults
            .insert(stage, names.into_iter().map(str::to_string).collect());
        self
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn knows_provider(&self, provider: &str) -> bool {
        self.providers.contains_key(&normalize_provider(provider))
    }

    fn provider_chain(&self, provider: &str, stage: Stage) -> Option<&[String]> {
        self.providers
            .get(provider)
            .and_then(|stages| stages.get(&stage))
            .map(Vec::as_slice)
            .filter(|names| !names.is_empty())
    }

    fn default_chain(&self, stage: Stage) -> &[String] {
        self.defaults.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The resolved chain for one stage.
#[derive(Clone)]
pub struct StageRoute {
    pub stage: Stage,
    /// Most preferred first.
    pub capabilities: Vec<Arc<dyn Capability>>,
    /// The provider had no usable binding; stage defaults were used.
    pub from_defaults: bool,
    /// Bound names that could not be used (unknown or wrong stage).
    pub skipped: Vec<String>,
}

impl StageRoute {
    pub fn names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name()).collect()
    }

    /// First preference, if any.
    pub fn preferred(&self) -> Option<&str> {
        self.capabilities.first().map(|c| c.name())
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl fmt::Debug for StageRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRoute")
            .field("stage", &self.stage)
            .field("capabilities", &self.names())
            .field("from_defaults", &self.from_defaults)
            .finish()
    }
}

/// Capability chains for every capability stage, fixed for one run.
#[derive(Debug, Clone)]
pub struct Routes {
    provider: String,
    stages: BTreeMap<Stage, StageRoute>,
}

impl Routes {
    /// Provider name as resolved (trimmed, lowercase).
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn route(&self, stage: Stage) -> Option<&StageRoute> {
        self.stages.get(&stage)
    }

    /// The chain for `stage`; empty for stages without capabilities.
    pub fn chain(&self, stage: Stage) -> &[Arc<dyn Capability>] {
        self.stages
            .get(&stage)
            .map(|r| r.capabilities.as_slice())
            .unwrap_or(&[])
    }

    /// One line per stage: `stage: cap1 > cap2 [defaults]`.
    pub fn describe(&self) -> Vec<String> {
        self.stages
            .values()
            .map(|route| {
                let chain = if route.is_empty() {
                    "(none)".to_string()
                } else {
                    route.names().join(" > ")
                };
                let mut line = format!("{}: {chain}", route.stage);
                if route.from_defaults {
                    line.push_str(" [defaults]");
                }
                if !route.skipped.is_empty() {
                    line.push_str(&format!(" (skipped: {})", route.skipped.join(", ")));
                }
                line
            })
            .collect()
    }
}

/// Resolves provider selectors against the binding table.
#[derive(Debug, Clone)]
pub struct ProviderRouter {
    registry: Arc<CapabilityRegistry>,
    bindings: Arc<BindingTable>,
}

impl ProviderRouter {
    pub fn new(registry: Arc<CapabilityRegistry>, bindings: Arc<BindingTable>) -> Self {
        Self { registry, bindings }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Resolve every capability stage for `provider`.
    ///
    /// Unknown providers, stages the provider does not bind, and bindings
    /// whose names all turn out unusable resolve to the stage defaults.
    /// Never fails; an empty chain is reported by the executor.
    pub fn resolve(&self, provider: &str) -> Routes {
        let provider = normalize_provider(provider);
        if !self.bindings.knows_provider(&provider) {
            tracing::warn!("provider '{provider}' has no bindings, using stage defaults");
        }

        let stages = Stage::CAPABILITY_STAGES
            .into_iter()
            .map(|stage| (stage, self.resolve_stage(&provider, stage)))
            .collect();

        Routes { provider, stages }
    }

    fn resolve_stage(&self, provider: &str, stage: Stage) -> StageRoute {
        let mut skipped = Vec::new();

        if let Some(names) = self.bindings.provider_chain(provider, stage) {
            let capabilities = self.lookup(stage, names, &mut skipped);
            if !capabilities.is_empty() {
                return StageRoute {
                    stage,
                    capabilities,
                    from_defaults: false,
                    skipped,
                };
            }
            tracing::warn!(
                "provider '{provider}' binds no usable capability for {stage}, using defaults"
            );
        }

        let capabilities = self.lookup(stage, self.bindings.default_chain(stage), &mut skipped);
        StageRoute {
            stage,
            capabilities,
            from_defaults: true,
            skipped,
        }
    }

    fn lookup(
        &self,
        stage: Stage,
        names: &[String],
        skipped: &mut Vec<String>,
    ) -> Vec<Arc<dyn Capability>> {
        let mut chain: Vec<Arc<dyn Capability>> = Vec::with_capacity(names.len());
        for name in names {
            match self.registry.get(name) {
                Some(cap) if cap.stage() == stage => {
                    if !chain.iter().any(|c| c.name() == name) {
                        chain.push(Arc::clone(cap));
                    }
                }
                Some(cap) => {
                    tracing::warn!(
                        "capability '{name}' serves {}, not {stage}; skipping",
                        cap.stage()
                    );
                    skipped.push(name.clone());
                }
                None => {
                    tracing::warn!("unknown capability '{name}' bound for {stage}; skipping");
                    skipped.push(name.clone());
                }
            }
        }
        chain
    }
}
