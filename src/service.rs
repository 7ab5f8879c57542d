//! Agent Service Abstraction
//!
//! Interface to the persistent, memory-bearing remote agent service. The gateway only
//! depends on this trait; `http` provides the concrete REST client.

use crate::agent::{AgentId, AgentIdentity};
use crate::error::GatewayError;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub mod http;

pub use http::HttpAgentService;

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One message handed to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: MessageRole,
    pub content: String,
}

impl AgentMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Translated request payload; opaque to the load-management layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    pub messages: Vec<AgentMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl AgentRequest {
    /// Single user message request
    pub fn from_text(content: impl Into<String>) -> Self {
        Self {
            messages: vec![AgentMessage::user(content)],
            user_id: None,
        }
    }
}

/// Kind of output an agent produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Assistant,
    Reasoning,
    ToolCall,
    ToolReturn,
    Usage,
}

/// One unit of agent output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentChunk {
    pub kind: ChunkKind,
    pub content: String,
}

impl AgentChunk {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Assistant,
            content: content.into(),
        }
    }
}

/// Complete (buffered) agent output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub chunks: Vec<AgentChunk>,
}

impl AgentResponse {
    pub fn from_text(content: impl Into<String>) -> Self {
        Self {
            chunks: vec![AgentChunk::assistant(content)],
        }
    }

    /// Assistant-visible text, concatenated in order
    pub fn content(&self) -> String {
        self.chunks
            .iter()
            .filter(|chunk| chunk.kind == ChunkKind::Assistant)
            .map(|chunk| chunk.content.as_str())
            .collect()
    }
}

/// Lazy sequence of agent output chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<AgentChunk, GatewayError>> + Send>>;

/// Remote agent service operations consumed by the gateway
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Send a request and wait for the complete reply
    async fn send(
        &self,
        agent: &AgentIdentity,
        request: &AgentRequest,
    ) -> Result<AgentResponse, GatewayError>;

    /// Send a request and receive the reply as it is produced
    async fn send_streaming(
        &self,
        agent: &AgentIdentity,
        request: &AgentRequest,
    ) -> Result<ChunkStream, GatewayError>;

    /// Compact the agent's conversation history to free context window
    async fn summarize(&self, agent: &AgentIdentity) -> Result<(), GatewayError>;

    /// Create a new agent duplicating `source`; returns the new agent's id
    async fn provision_clone(&self, source: &AgentIdentity) -> Result<AgentId, GatewayError>;

    /// Discard an agent previously created by `provision_clone`
    async fn retire(&self, agent: &AgentIdentity) -> Result<(), GatewayError>;
}
