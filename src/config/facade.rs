//! Configuration loader facade.

use super::merge::merge_policy;
use super::sources::{environment, global_file, local_file};
use super::GatewayConfig;
use crate::error::GatewayError;
use config::{Config, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resolves `GatewayConfig` from its layered sources
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for `dir`.
    ///
    /// Precedence, lowest first: defaults, global file, `dir/librarian.toml`,
    /// `dir/config/{LIBRARIAN_ENV}.toml`, `LIBRARIAN_*` structured variables, flat
    /// deployment variables.
    pub fn load(dir: &Path) -> Result<GatewayConfig, GatewayError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = local_file::add_to_builder(builder, dir)?;
        let builder = environment::add_to_builder(builder)?;

        let config = Self::finish(builder.build()?)?;
        info!(
            dir = %dir.display(),
            models = config.models.len(),
            base_url = %config.backend.base_url,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load one explicit file over the defaults, still honoring environment overrides
    pub fn load_from_file(path: &Path) -> Result<GatewayConfig, GatewayError> {
        if !path.exists() {
            return Err(GatewayError::ConfigError(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let builder = merge_policy::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true));
        let builder = environment::add_to_builder(builder)?;

        let config = Self::finish(builder.build()?)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Path of the global configuration file
    pub fn global_config_path() -> Option<PathBuf> {
        global_file::global_config_path()
    }

    fn finish(raw: Config) -> Result<GatewayConfig, GatewayError> {
        let mut config: GatewayConfig = raw.try_deserialize()?;
        for (model, agent_id) in environment::agent_overrides() {
            if let Some(model_config) = config.models.get_mut(model) {
                model_config.agent_id = agent_id;
            }
        }
        Ok(config)
    }
}
