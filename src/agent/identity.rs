//! Agent identity model.
//!
//! An identity is an opaque handle to one remote agent instance. Each logical model
//! is served by exactly one primary identity plus any clones provisioned under load.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Remote agent id as issued by the agent service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        AgentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        AgentId(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        AgentId(id)
    }
}

/// Role of an identity within its family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityRole {
    /// Provisioned out of band, lives for the whole gateway lifetime
    Primary,
    /// Provisioned by the duplication controller to absorb excess load
    Clone,
}

/// One addressable agent instance
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Remote agent id
    pub id: AgentId,
    /// Primary or clone
    pub role: IdentityRole,
    /// When the clone became routable (None for the primary)
    pub created_at: Option<Instant>,
}

impl AgentIdentity {
    /// Create the primary identity of a family
    pub fn primary(id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            role: IdentityRole::Primary,
            created_at: None,
        }
    }

    /// Create a freshly provisioned clone identity
    pub fn clone_of(id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            role: IdentityRole::Clone,
            created_at: Some(Instant::now()),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == IdentityRole::Primary
    }
}
