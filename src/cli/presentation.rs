//! CLI presentation: formatters for models, configuration and replies.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::service::AgentResponse;
use comfy_table::{presets::UTF8_FULL, Table};

/// Models table: one row per logical model
pub fn format_models_text(config: &GatewayConfig) -> String {
    if config.models.is_empty() {
        return "No models configured.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Model", "Agent", "Mode", "Max clones", "Description"]);
    for (name, model) in &config.models {
        let max_clones = model.max_clones.unwrap_or(config.load.max_clones);
        table.add_row(vec![
            name.clone(),
            model.agent_id.clone(),
            model.mode.to_string(),
            max_clones.to_string(),
            model.description.clone().unwrap_or_default(),
        ]);
    }
    table.to_string()
}

pub fn format_models_json(config: &GatewayConfig) -> Result<String, GatewayError> {
    let models: Vec<serde_json::Value> = config
        .models
        .iter()
        .map(|(name, model)| {
            serde_json::json!({
                "id": name,
                "object": "model",
                "owned_by": "librarian",
                "agent_id": model.agent_id,
                "mode": model.mode,
                "description": model.description,
                "max_clones": model.max_clones.unwrap_or(config.load.max_clones),
            })
        })
        .collect();
    let out = serde_json::json!({ "object": "list", "data": models });
    serde_json::to_string_pretty(&out)
        .map_err(|e| GatewayError::ConfigError(format!("Failed to render models: {}", e)))
}

/// Resolved configuration as TOML
pub fn format_config_toml(config: &GatewayConfig) -> Result<String, GatewayError> {
    let mut config = config.clone();
    if config.backend.api_key.is_some() {
        config.backend.api_key = Some("********".to_string());
    }
    toml::to_string_pretty(&config)
        .map_err(|e| GatewayError::ConfigError(format!("Failed to render configuration: {}", e)))
}

pub fn format_reply(response: &AgentResponse) -> String {
    let content = response.content();
    if content.is_empty() {
        "(empty reply)".to_string()
    } else {
        content
    }
}
