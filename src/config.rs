//! Configuration System
//!
//! Layered gateway configuration: built-in defaults, global and local TOML files, then
//! environment overrides. The resolved configuration is validated before any dispatcher
//! is built from it.

use crate::dispatch::LoadConfig;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Built-in logical model mappings: (model, agent id, mode, description)
pub const BUILTIN_MODELS: &[(&str, &str, AgentMode, &str)] = &[
    (
        "gpt-3.5-turbo",
        "librarian-worker",
        AgentMode::Worker,
        "The Librarian in Worker Mode",
    ),
    (
        "gpt-4",
        "librarian-persona",
        AgentMode::Persona,
        "The Librarian in Persona Mode",
    ),
    (
        "gpt-4-turbo",
        "librarian-persona-turbo",
        AgentMode::Persona,
        "The Librarian in Persona Mode (Turbo)",
    ),
];

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Remote agent service connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Load management
    #[serde(default)]
    pub load: LoadSettings,

    /// Logical model name -> agent family
    #[serde(default = "builtin_models")]
    pub models: BTreeMap<String, ModelConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            load: LoadSettings::default(),
            models: builtin_models(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Remote agent service connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-call backend timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Messages kept verbatim when the agent's history is summarized
    #[serde(default = "default_summarize_keep_messages")]
    pub summarize_keep_messages: usize,
}

fn default_base_url() -> String {
    "http://localhost:8283".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_summarize_keep_messages() -> usize {
    10
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            summarize_keep_messages: default_summarize_keep_messages(),
        }
    }
}

/// Load-management settings as written in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_duplication_threshold")]
    pub duplication_threshold: usize,
    #[serde(default = "default_max_clones")]
    pub max_clones: usize,
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    #[serde(default = "default_clone_cooldown_secs")]
    pub clone_cooldown_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enable_auto_duplication: bool,
    #[serde(default = "default_true")]
    pub retry_on_context_full: bool,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_duplication_threshold() -> usize {
    8
}

fn default_max_clones() -> usize {
    3
}

fn default_queue_timeout_secs() -> u64 {
    300
}

fn default_clone_cooldown_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            duplication_threshold: default_duplication_threshold(),
            max_clones: default_max_clones(),
            queue_timeout_secs: default_queue_timeout_secs(),
            clone_cooldown_secs: default_clone_cooldown_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            enable_auto_duplication: true,
            retry_on_context_full: true,
        }
    }
}

impl From<&LoadSettings> for LoadConfig {
    fn from(settings: &LoadSettings) -> Self {
        LoadConfig {
            max_concurrent: settings.max_concurrent,
            duplication_threshold: settings.duplication_threshold,
            max_clones: settings.max_clones,
            queue_timeout: Duration::from_secs(settings.queue_timeout_secs),
            clone_cooldown: Duration::from_secs(settings.clone_cooldown_secs),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs),
            enable_auto_duplication: settings.enable_auto_duplication,
            retry_on_context_full: settings.retry_on_context_full,
        }
    }
}

/// Behavior profile of the agent behind a logical model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Worker,
    Persona,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Worker => write!(f, "worker"),
            AgentMode::Persona => write!(f, "persona"),
        }
    }
}

/// One logical model's agent family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Primary agent id, provisioned out of band
    pub agent_id: String,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Per-family clone ceiling; falls back to `load.max_clones`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_clones: Option<usize>,
}

fn builtin_models() -> BTreeMap<String, ModelConfig> {
    BUILTIN_MODELS
        .iter()
        .map(|(model, agent_id, mode, description)| {
            (
                model.to_string(),
                ModelConfig {
                    agent_id: agent_id.to_string(),
                    mode: *mode,
                    description: Some(description.to_string()),
                    max_clones: None,
                },
            )
        })
        .collect()
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Backend(String),
    Load(String),
    Model(String, String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Backend(msg) => write!(f, "Backend: {}", msg),
            ValidationError::Load(msg) => write!(f, "Load: {}", msg),
            ValidationError::Model(name, msg) => write!(f, "Model '{}': {}", name, msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), String> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("base_url must be an http(s) URL, got '{}'", self.base_url));
        }
        if reqwest::Url::parse(url).is_err() {
            return Err(format!("base_url '{}' is not a valid URL", self.base_url));
        }
        if self.timeout_secs == 0 {
            return Err("timeout_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Upper bound for every duration setting (one week)
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

impl LoadSettings {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_concurrent == 0 {
            problems.push("max_concurrent must be positive".to_string());
        }
        if self.max_concurrent > u32::MAX as usize {
            problems.push("max_concurrent is too large".to_string());
        }
        if self.duplication_threshold == 0 {
            problems.push("duplication_threshold must be positive".to_string());
        }
        if self.queue_timeout_secs == 0 {
            problems.push("queue_timeout_secs must be positive".to_string());
        }
        for (name, secs) in [
            ("queue_timeout_secs", self.queue_timeout_secs),
            ("clone_cooldown_secs", self.clone_cooldown_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                problems.push(format!(
                    "{} must be at most {} seconds",
                    name, MAX_DURATION_SECS
                ));
            }
        }
        if self.clone_cooldown_secs == 0 {
            problems.push("clone_cooldown_secs must be positive".to_string());
        }
        if self.cleanup_interval_secs == 0 {
            problems.push("cleanup_interval_secs must be positive".to_string());
        }
        problems
    }
}

impl GatewayConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.backend.validate() {
            errors.push(ValidationError::Backend(e));
        }

        errors.extend(self.load.validate().into_iter().map(ValidationError::Load));

        if self.models.is_empty() {
            errors.push(ValidationError::Load(
                "at least one model must be configured".to_string(),
            ));
        }

        // Families must not share a primary agent
        let mut agent_ids: HashMap<&str, &str> = HashMap::new();
        for (name, model) in &self.models {
            if model.agent_id.trim().is_empty() {
                errors.push(ValidationError::Model(
                    name.clone(),
                    "agent_id cannot be empty".to_string(),
                ));
                continue;
            }
            if let Some(existing) = agent_ids.insert(model.agent_id.as_str(), name.as_str()) {
                errors.push(ValidationError::Model(
                    name.clone(),
                    format!(
                        "Duplicate agent_id '{}' (also used by '{}')",
                        model.agent_id, existing
                    ),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Runtime load settings for the dispatcher
    pub fn load_config(&self) -> LoadConfig {
        LoadConfig::from(&self.load)
    }
}
