//! Librarian: Load-Managed Agent Gateway
//!
//! Routes chat-completion requests for logical model names to families of persistent,
//! memory-bearing remote agents. Each agent takes a bounded number of simultaneous
//! calls; excess requests queue in arrival order, busy families grow by cloning their
//! primary agent, and context-window overflows are answered by summarizing the agent's
//! history and retrying once.

pub mod agent;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod service;
