//! Agent handle registry: logical model -> agent family.
//!
//! Each family owns a stable primary identity and an ordered, dynamic list of clones.
//! Families are individually locked so load on one model never contends with another.

use crate::agent::identity::{AgentId, AgentIdentity};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Primary identity plus clones serving one logical model
#[derive(Debug)]
pub struct AgentFamily {
    model: String,
    primary: AgentIdentity,
    clones: Vec<AgentIdentity>,
    max_clones: usize,
    /// At most one provisioning operation per family at a time
    provisioning: bool,
    /// Start of the current stretch with load below the duplication threshold
    below_threshold_since: Option<Instant>,
}

impl AgentFamily {
    pub fn new(model: impl Into<String>, primary: impl Into<AgentId>, max_clones: usize) -> Self {
        Self {
            model: model.into(),
            primary: AgentIdentity::primary(primary),
            clones: Vec::new(),
            max_clones,
            provisioning: false,
            below_threshold_since: None,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn primary(&self) -> &AgentIdentity {
        &self.primary
    }

    pub fn clones(&self) -> &[AgentIdentity] {
        &self.clones
    }

    pub fn max_clones(&self) -> usize {
        self.max_clones
    }

    pub fn is_provisioning(&self) -> bool {
        self.provisioning
    }

    /// All routable identities in creation order, primary first
    pub fn identities(&self) -> impl Iterator<Item = &AgentIdentity> {
        std::iter::once(&self.primary).chain(self.clones.iter())
    }

    /// Claim the provisioning slot. Returns false when a provisioning operation is
    /// already running or the family is at its clone ceiling.
    pub fn begin_provisioning(&mut self) -> bool {
        if self.provisioning || self.clones.len() >= self.max_clones {
            return false;
        }
        self.provisioning = true;
        true
    }

    /// Release the provisioning slot, adding the new clone when one was created.
    pub fn finish_provisioning(&mut self, clone: Option<AgentIdentity>) -> bool {
        self.provisioning = false;
        match clone {
            Some(identity) if self.clones.len() < self.max_clones => {
                self.clones.push(identity);
                true
            }
            _ => false,
        }
    }

    /// Remove a clone. The primary is never removed.
    pub fn remove_clone(&mut self, id: &AgentId) -> Option<AgentIdentity> {
        let index = self.clones.iter().position(|clone| &clone.id == id)?;
        Some(self.clones.remove(index))
    }

    /// Record the current family load against the duplication threshold
    pub fn observe_load(&mut self, load: usize, threshold: usize, now: Instant) {
        if load < threshold {
            self.below_threshold_since.get_or_insert(now);
        } else {
            self.below_threshold_since = None;
        }
    }

    /// How long load has continuously stayed below the threshold
    pub fn below_threshold_for(&self, now: Instant) -> Option<Duration> {
        self.below_threshold_since
            .map(|since| now.saturating_duration_since(since))
    }
}

/// Order identities for dispatch: only those with spare capacity, least loaded
/// first, ties kept in creation order (primary first).
pub fn rank_by_load(
    loads: Vec<(AgentIdentity, usize)>,
    max_concurrent: usize,
) -> Vec<AgentIdentity> {
    let mut eligible: Vec<(AgentIdentity, usize)> = loads
        .into_iter()
        .filter(|(_, load)| *load < max_concurrent)
        .collect();
    // sort_by_key is stable, so equal loads keep creation order
    eligible.sort_by_key(|(_, load)| *load);
    eligible.into_iter().map(|(identity, _)| identity).collect()
}

/// Registry of agent families keyed by logical model name
pub struct AgentRegistry {
    families: RwLock<HashMap<String, Arc<Mutex<AgentFamily>>>>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            families: RwLock::new(HashMap::new()),
        }
    }

    /// Build the registry from configured model mappings
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let registry = Self::new();
        for (model, model_config) in &config.models {
            let max_clones = model_config.max_clones.unwrap_or(config.load.max_clones);
            registry.register_family(model, model_config.agent_id.as_str(), max_clones)?;
        }
        Ok(registry)
    }

    /// Register a logical model with its externally provisioned primary agent
    pub fn register_family(
        &self,
        model: &str,
        primary: impl Into<AgentId>,
        max_clones: usize,
    ) -> Result<(), GatewayError> {
        let mut families = self.families.write();
        if families.contains_key(model) {
            return Err(GatewayError::ConfigError(format!(
                "Model '{}' is already registered",
                model
            )));
        }
        families.insert(
            model.to_string(),
            Arc::new(Mutex::new(AgentFamily::new(model, primary, max_clones))),
        );
        Ok(())
    }

    /// Get a family handle by logical model name
    pub fn family(&self, model: &str) -> Option<Arc<Mutex<AgentFamily>>> {
        self.families.read().get(model).cloned()
    }

    /// Get a family handle or fail with `UnknownModel`
    pub fn family_or_error(&self, model: &str) -> Result<Arc<Mutex<AgentFamily>>, GatewayError> {
        self.family(model)
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))
    }

    /// Registered logical models, sorted by name
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.families.read().keys().cloned().collect();
        models.sort();
        models
    }

    /// Snapshot of a family's routable identities
    pub fn identities(&self, model: &str) -> Vec<AgentIdentity> {
        self.family(model)
            .map(|family| family.lock().identities().cloned().collect())
            .unwrap_or_default()
    }

    /// Candidates for the next dispatch on `model`, best first.
    ///
    /// `load_of` reports the live in-flight count of an identity; the caller's
    /// admission check stays authoritative since counts may move after ranking.
    pub fn rank_candidates<F>(&self, model: &str, load_of: F, max_concurrent: usize) -> Vec<AgentIdentity>
    where
        F: Fn(&AgentId) -> usize,
    {
        let loads = self
            .identities(model)
            .into_iter()
            .map(|identity| {
                let load = load_of(&identity.id);
                (identity, load)
            })
            .collect();
        rank_by_load(loads, max_concurrent)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
