//! Error types for the Librarian gateway.

use thiserror::Error;

/// Lower-cased fragments the agent service uses when a conversation no longer fits
/// its context window.
pub const CONTEXT_FULL_SIGNATURES: &[&str] = &[
    "context window full",
    "context window exceeded",
    "context length exceeded",
    "context overflow",
    "token limit exceeded",
    "context_window",
    "context is full",
    "maximum context length",
    "context_length_exceeded",
];

/// Gateway errors
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Queue timeout: request for model '{model}' waited {waited_ms} ms without an available agent")]
    QueueTimeout { model: String, waited_ms: u128 },

    #[error("Context window full: {0}")]
    ContextFull(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Provision error: {0}")]
    Provision(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl GatewayError {
    /// True when the error carries the context-overflow signature.
    pub fn is_context_full(&self) -> bool {
        match self {
            GatewayError::ContextFull(_) => true,
            GatewayError::Backend(message) => matches_context_full(message),
            _ => false,
        }
    }

    /// True for capacity failures the caller should answer with "try again later".
    pub fn is_retry_later(&self) -> bool {
        matches!(
            self,
            GatewayError::QueueTimeout { .. }
                | GatewayError::ShuttingDown
                | GatewayError::AgentUnavailable(_)
        )
    }
}

/// Check a raw service message against the known context-overflow signatures.
pub fn matches_context_full(message: &str) -> bool {
    let lowered = message.to_lowercase();
    CONTEXT_FULL_SIGNATURES
        .iter()
        .any(|indicator| lowered.contains(indicator))
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::ConfigError(err.to_string())
    }
}
