//! Configuration files driving the registry and CLI context.

use librarian::agent::AgentRegistry;
use librarian::cli::{Commands, RunContext};
use librarian::config::{AgentMode, ConfigLoader};
use librarian::error::GatewayError;
use tempfile::TempDir;

const CONFIG: &str = r#"
[backend]
base_url = "http://agents.internal:8283"
timeout_secs = 30

[load]
max_concurrent = 4
duplication_threshold = 6
max_clones = 2

[models.gpt-4]
agent_id = "agent-persona"
mode = "persona"
description = "Persona agent"

[models."gpt-3.5-turbo"]
agent_id = "agent-worker"
max_clones = 5
"#;

fn write_config(contents: &str) -> (TempDir, std::path::PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("gateway.toml");
    std::fs::write(&path, contents).unwrap();
    (temp_dir, path)
}

#[test]
fn test_models_table_replaces_builtin_models() {
    let (_temp_dir, path) = write_config(CONFIG);
    let config = ConfigLoader::load_from_file(&path).unwrap();

    assert_eq!(config.backend.base_url, "http://agents.internal:8283");
    assert_eq!(config.models.len(), 2);
    assert!(!config.models.contains_key("gpt-4-turbo"));
    assert_eq!(config.models["gpt-4"].mode, AgentMode::Persona);
    assert_eq!(config.models["gpt-3.5-turbo"].mode, AgentMode::Worker);
    assert!(config.validate().is_ok());

    let load = config.load_config();
    assert_eq!(load.max_concurrent, 4);
    assert_eq!(load.duplication_threshold, 6);
}

#[test]
fn test_registry_from_config_applies_clone_ceilings() {
    let (_temp_dir, path) = write_config(CONFIG);
    let config = ConfigLoader::load_from_file(&path).unwrap();
    let registry = AgentRegistry::from_config(&config).unwrap();

    assert_eq!(registry.models(), vec!["gpt-3.5-turbo", "gpt-4"]);
    let persona = registry.family("gpt-4").unwrap();
    assert_eq!(persona.lock().max_clones(), 2);
    assert_eq!(persona.lock().primary().id.as_str(), "agent-persona");
    let worker = registry.family("gpt-3.5-turbo").unwrap();
    assert_eq!(worker.lock().max_clones(), 5);
}

#[test]
fn test_invalid_file_is_rejected_by_run_context() {
    let (temp_dir, path) = write_config(
        r#"
[backend]
base_url = "ftp://agents.internal"

[models.gpt-4]
agent_id = "shared"

[models.gpt-4-turbo]
agent_id = "shared"
"#,
    );
    let result = RunContext::new(temp_dir.path().to_path_buf(), Some(path));
    match result {
        Err(GatewayError::ConfigError(message)) => {
            assert!(message.contains("Duplicate agent_id"));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("invalid configuration accepted"),
    }
}

#[tokio::test]
async fn test_run_context_renders_models_and_config() {
    let (temp_dir, path) = write_config(CONFIG);
    let context = RunContext::new(temp_dir.path().to_path_buf(), Some(path)).unwrap();

    let models = context
        .execute(&Commands::Models {
            format: "json".to_string(),
        })
        .await
        .unwrap();
    let models: serde_json::Value = serde_json::from_str(&models).unwrap();
    assert_eq!(models["data"].as_array().unwrap().len(), 2);

    let rendered = context.execute(&Commands::Config).await.unwrap();
    let reparsed: toml::Value = toml::from_str(&rendered).unwrap();
    assert_eq!(reparsed["load"]["max_concurrent"].as_integer(), Some(4));
}
