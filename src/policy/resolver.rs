//! Layered policy resolution: global, team, provider, model, then run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::{PolicyOverride, RunPolicy};
use crate::error::PolicyError;
use crate::models::Provider;

/// Folds `layers` left to right over `base` and validates the result.
pub fn resolve_policy(
    base: RunPolicy,
    layers: &[&PolicyOverride],
) -> Result<RunPolicy, PolicyError> {
    let resolved = layers
        .iter()
        .fold(base, |policy, layer| layer.apply(policy));
    resolved.validate()?;
    Ok(resolved)
}

/// Selects which keyed layers participate in a resolution.
#[derive(Debug, Clone, Default)]
pub struct PolicyScope {
    pub team: Option<String>,
    pub provider: Option<Provider>,
    pub model: Option<String>,
}

impl PolicyScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// All configured policy layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyLayers {
    pub global: PolicyOverride,
    pub team: HashMap<String, PolicyOverride>,
    pub provider: HashMap<Provider, PolicyOverride>,
    pub model: HashMap<String, PolicyOverride>,
    /// Run-specific override, applied last.
    pub run: Option<PolicyOverride>,
}

impl PolicyLayers {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Returns a copy carrying `run` as the run-specific layer.
    pub fn with_run_override(mut self, run: PolicyOverride) -> Self {
        self.run = Some(run);
        self
    }

    /// The layers that apply to `scope`, in merge order.
    pub fn layers_for(&self, scope: &PolicyScope) -> Vec<&PolicyOverride> {
        let mut layers = vec![&self.global];
        if let Some(layer) = scope.team.as_ref().and_then(|t| self.team.get(t)) {
            layers.push(layer);
        }
        if let Some(layer) = scope.provider.as_ref().and_then(|p| self.provider.get(p)) {
            layers.push(layer);
        }
        if let Some(layer) = scope.model.as_ref().and_then(|m| self.model.get(m)) {
            layers.push(layer);
        }
        if let Some(layer) = self.run.as_ref() {
            layers.push(layer);
        }
        layers
    }

    /// Resolves the effective policy for `scope` over the built-in defaults.
    pub fn resolve(&self, scope: &PolicyScope) -> Result<RunPolicy, PolicyError> {
        resolve_policy(RunPolicy::default(), &self.layers_for(scope))
    }
}
