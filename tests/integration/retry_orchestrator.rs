//! Context-overflow recovery through the dispatcher.

use super::support::{dispatcher, load_config, FakeAgentService, MODEL, PRIMARY};
use futures::StreamExt;
use librarian::agent::AgentId;
use librarian::dispatch::LoadConfig;
use librarian::error::GatewayError;
use librarian::service::AgentRequest;
use std::sync::Arc;

#[tokio::test]
async fn test_overflow_once_summarizes_and_retries() {
    let service = Arc::new(FakeAgentService::new());
    service.overflow_next(1);
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));

    let reply = dispatcher
        .submit(MODEL, AgentRequest::from_text("long history"), None)
        .await
        .unwrap();
    assert_eq!(reply.content(), "reply to long history");
    assert_eq!(FakeAgentService::count(&service.sends), 2);
    assert_eq!(FakeAgentService::count(&service.summarizes), 1);
    assert_eq!(dispatcher.in_flight(&AgentId::new(PRIMARY)), 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_overflow_twice_fails_with_backend_error() {
    let service = Arc::new(FakeAgentService::new());
    service.overflow_next(2);
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));

    let result = dispatcher
        .submit(MODEL, AgentRequest::from_text("still too long"), None)
        .await;
    assert!(matches!(result, Err(GatewayError::Backend(_))));
    assert_eq!(FakeAgentService::count(&service.sends), 2);
    assert_eq!(FakeAgentService::count(&service.summarizes), 1);
    assert_eq!(dispatcher.in_flight(&AgentId::new(PRIMARY)), 0);

    // The agent stays usable for the next request
    let reply = dispatcher
        .submit(MODEL, AgentRequest::from_text("short"), None)
        .await
        .unwrap();
    assert_eq!(reply.content(), "reply to short");
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_overflow_with_retry_disabled_surfaces_context_full() {
    let service = Arc::new(FakeAgentService::new());
    service.overflow_next(1);
    let config = LoadConfig {
        retry_on_context_full: false,
        ..load_config(1)
    };
    let dispatcher = dispatcher(Arc::clone(&service), config);

    let result = dispatcher
        .submit(MODEL, AgentRequest::from_text("long history"), None)
        .await;
    assert!(matches!(result, Err(ref error) if error.is_context_full()));
    assert_eq!(FakeAgentService::count(&service.summarizes), 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_streaming_overflow_before_first_chunk_retries() {
    let service = Arc::new(FakeAgentService::new());
    service.overflow_next(1);
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));

    let stream = dispatcher
        .submit_streaming(MODEL, AgentRequest::from_text("hello"), None)
        .await
        .unwrap();
    let chunks: Vec<String> = stream
        .map(|chunk| chunk.unwrap().content)
        .collect()
        .await;
    assert_eq!(chunks.concat(), "reply to hello");
    assert_eq!(FakeAgentService::count(&service.summarizes), 1);
    assert_eq!(dispatcher.in_flight(&AgentId::new(PRIMARY)), 0);
    dispatcher.shutdown().await;
}
