//! Merge rules: defaults, override order, conflict handling.
//!
//! Later sources override earlier ones key by key. Model tables are the exception:
//! a `models` table in any file replaces the built-in mappings as a whole.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("backend.base_url", "http://localhost:8283")?
        .set_default("backend.timeout_secs", 30)?
        .set_default("backend.summarize_keep_messages", 10)?
        .set_default("load.max_concurrent", 10)?
        .set_default("load.duplication_threshold", 8)?
        .set_default("load.max_clones", 3)?
        .set_default("load.queue_timeout_secs", 300)?
        .set_default("load.clone_cooldown_secs", 300)?
        .set_default("load.cleanup_interval_secs", 60)?
        .set_default("load.enable_auto_duplication", true)?
        .set_default("load.retry_on_context_full", true)
}
