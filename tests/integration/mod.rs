//! Integration tests for the Librarian agent gateway

mod config_integration;
mod dispatcher;
mod retry_orchestrator;
mod support;
