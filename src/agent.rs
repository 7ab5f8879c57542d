//! Agent Families
//!
//! Identity model for remote agent instances and the registry mapping each
//! client-visible logical model to the family of agents serving it.

pub mod identity;
pub mod registry;

pub use identity::{AgentId, AgentIdentity, IdentityRole};
pub use registry::{rank_by_load, AgentFamily, AgentRegistry};
