//! CLI route: single route table and run context. Dispatches to the gateway and presentation.

use crate::agent::AgentRegistry;
use crate::config::{ConfigLoader, GatewayConfig};
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::service::{AgentRequest, AgentService, ChunkKind, HttpAgentService};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::cli::parse::Commands;
use crate::cli::presentation::{
    format_config_toml, format_models_json, format_models_text, format_reply,
};

/// Runtime context for CLI execution: resolved configuration and the agent service.
/// Built from a directory and optional config path using ConfigLoader only.
pub struct RunContext {
    config: GatewayConfig,
    service: Option<Arc<dyn AgentService>>,
}

impl RunContext {
    /// Create run context from a directory and optional config path. Uses ConfigLoader only.
    pub fn new(dir: PathBuf, config_path: Option<PathBuf>) -> Result<Self, GatewayError> {
        let config = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&dir)?
        };
        Self::from_config(config)
    }

    /// Create run context from an already resolved configuration
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            GatewayError::ConfigError(format!("Invalid configuration: {}", messages.join("; ")))
        })?;
        Ok(Self {
            config,
            service: None,
        })
    }

    /// Use `service` instead of the HTTP agent service
    pub fn with_service(mut self, service: Arc<dyn AgentService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn agent_service(&self) -> Result<Arc<dyn AgentService>, GatewayError> {
        match &self.service {
            Some(service) => Ok(Arc::clone(service)),
            None => Ok(Arc::new(HttpAgentService::new(&self.config.backend)?)),
        }
    }

    /// Execute a command and return its printable output
    pub async fn execute(&self, command: &Commands) -> Result<String, GatewayError> {
        match command {
            Commands::Models { format } => match format.as_str() {
                "json" => format_models_json(&self.config),
                _ => Ok(format_models_text(&self.config)),
            },
            Commands::Config => format_config_toml(&self.config),
            Commands::Chat {
                model,
                stream,
                timeout_secs,
                message,
            } => {
                self.handle_chat(model, *stream, timeout_secs.map(Duration::from_secs), message)
                    .await
            }
        }
    }

    async fn handle_chat(
        &self,
        model: &str,
        stream: bool,
        timeout: Option<Duration>,
        message: &str,
    ) -> Result<String, GatewayError> {
        let registry = Arc::new(AgentRegistry::from_config(&self.config)?);
        let dispatcher = Dispatcher::new(registry, self.agent_service()?, self.config.load_config());
        dispatcher.start();

        let started = Instant::now();
        let request = AgentRequest::from_text(message);
        let result = if stream {
            stream_reply(&dispatcher, model, request, timeout).await
        } else {
            dispatcher
                .submit(model, request, timeout)
                .await
                .map(|response| format_reply(&response))
        };
        dispatcher.shutdown().await;

        info!(
            model = %model,
            stream,
            ok = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Chat command finished"
        );
        result
    }
}

/// Print assistant chunks as they arrive; the returned output is empty
async fn stream_reply(
    dispatcher: &Dispatcher,
    model: &str,
    request: AgentRequest,
    timeout: Option<Duration>,
) -> Result<String, GatewayError> {
    let mut chunks = dispatcher.submit_streaming(model, request, timeout).await?;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if chunk.kind == ChunkKind::Assistant {
            print!("{}", chunk.content);
            let _ = stdout.flush();
        }
    }
    Ok(String::new())
}
