//! Environment sources.
//!
//! Structured overrides use `LIBRARIAN_<SECTION>__<KEY>` (for example
//! `LIBRARIAN_LOAD__MAX_CONCURRENT`). The flat variable names used by existing
//! deployments are honored on top of those.

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::Environment;

/// Flat variables and the configuration key each one sets
pub const FLAT_VARIABLES: &[(&str, &str)] = &[
    ("LETTA_BASE_URL", "backend.base_url"),
    ("LETTA_API_KEY", "backend.api_key"),
    ("LETTA_TIMEOUT", "backend.timeout_secs"),
    ("LIBRARIAN_MAX_CONCURRENT", "load.max_concurrent"),
    ("LIBRARIAN_DUPLICATION_THRESHOLD", "load.duplication_threshold"),
    ("LIBRARIAN_QUEUE_TIMEOUT", "load.queue_timeout_secs"),
    ("LIBRARIAN_CLEANUP_INTERVAL", "load.cleanup_interval_secs"),
    ("LIBRARIAN_ENABLE_AUTO_DUPLICATION", "load.enable_auto_duplication"),
    ("LIBRARIAN_MAX_CLONES_PER_AGENT", "load.max_clones"),
];

/// Primary agent overrides for the built-in models: (variable, model)
pub const AGENT_VARIABLES: &[(&str, &str)] = &[
    ("LIBRARIAN_WORKER_AGENT", "gpt-3.5-turbo"),
    ("LIBRARIAN_PERSONA_AGENT", "gpt-4"),
    ("LIBRARIAN_PERSONA_TURBO_AGENT", "gpt-4-turbo"),
];

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Add environment sources to builder.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let mut builder = builder.add_source(
        Environment::with_prefix("LIBRARIAN")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    for (variable, key) in FLAT_VARIABLES {
        builder = builder.set_override_option(*key, non_empty_var(variable))?;
    }

    Ok(builder)
}

/// Primary agent id overrides, keyed by logical model
pub fn agent_overrides() -> Vec<(&'static str, String)> {
    AGENT_VARIABLES
        .iter()
        .filter_map(|(variable, model)| non_empty_var(variable).map(|agent| (*model, agent)))
        .collect()
}
