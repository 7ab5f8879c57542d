//! Dispatcher behavior: per-agent bound, arrival order, timeouts and abandonment.

use super::support::{dispatcher, load_config, wait_until, FakeAgentService, MODEL, PRIMARY};
use futures::StreamExt;
use librarian::agent::AgentId;
use librarian::dispatch::RequestStatus;
use librarian::error::GatewayError;
use librarian::service::AgentRequest;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_in_flight_never_exceeds_bound() {
    let service = Arc::new(FakeAgentService::holding());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(2));
    let primary = AgentId::new(PRIMARY);

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .submit(MODEL, AgentRequest::from_text(format!("m{}", i)), None)
                    .await
            })
        })
        .collect();

    assert!(wait_until(|| dispatcher.in_flight(&primary) == 2 && dispatcher.queued(MODEL) == 3).await);
    assert_eq!(service.peak(PRIMARY), 2);

    service.release(5);
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert!(response.content().starts_with("reply to m"));
    }
    assert_eq!(service.peak(PRIMARY), 2);
    assert!(wait_until(|| dispatcher.in_flight(&primary) == 0).await);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_waiting_requests_are_served_in_arrival_order() {
    let service = Arc::new(FakeAgentService::holding());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));
    let primary = AgentId::new(PRIMARY);

    let mut handles = Vec::new();
    for (i, text) in ["first", "a", "b", "c"].iter().enumerate() {
        let dispatcher_ref = Arc::clone(&dispatcher);
        let text = text.to_string();
        handles.push(tokio::spawn(async move {
            dispatcher_ref
                .submit(MODEL, AgentRequest::from_text(text), None)
                .await
        }));
        if i == 0 {
            assert!(wait_until(|| dispatcher.in_flight(&primary) == 1).await);
        } else {
            assert!(wait_until(|| dispatcher.queued(MODEL) == i).await);
        }
    }

    for _ in 0..4 {
        service.release(1);
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(service.served_messages(), vec!["first", "a", "b", "c"]);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_queue_timeout_removes_request() {
    let service = Arc::new(FakeAgentService::holding());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));
    let primary = AgentId::new(PRIMARY);

    let busy = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .submit(MODEL, AgentRequest::from_text("long"), None)
                .await
        })
    };
    assert!(wait_until(|| dispatcher.in_flight(&primary) == 1).await);

    let result = dispatcher
        .submit(
            MODEL,
            AgentRequest::from_text("impatient"),
            Some(Duration::from_millis(50)),
        )
        .await;
    match result {
        Err(error @ GatewayError::QueueTimeout { .. }) => assert!(error.is_retry_later()),
        other => panic!("expected queue timeout, got {:?}", other.map(|r| r.content())),
    }
    assert_eq!(dispatcher.queued(MODEL), 0);

    service.release(1);
    busy.await.unwrap().unwrap();
    assert_eq!(service.served_messages(), vec!["long"]);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_queued_request_leaves_queue() {
    let service = Arc::new(FakeAgentService::holding());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));
    let primary = AgentId::new(PRIMARY);

    let busy = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .submit(MODEL, AgentRequest::from_text("long"), None)
                .await
        })
    };
    assert!(wait_until(|| dispatcher.in_flight(&primary) == 1).await);

    let abandoned = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .submit(MODEL, AgentRequest::from_text("gone"), None)
                .await
        })
    };
    assert!(wait_until(|| dispatcher.queued(MODEL) == 1).await);
    abandoned.abort();
    assert!(wait_until(|| dispatcher.queued(MODEL) == 0).await);

    service.release(2);
    busy.await.unwrap().unwrap();
    let next = dispatcher
        .submit(MODEL, AgentRequest::from_text("next"), None)
        .await
        .unwrap();
    assert_eq!(next.content(), "reply to next");
    assert_eq!(service.served_messages(), vec!["long", "next"]);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_dropping_stream_releases_agent() {
    let service = Arc::new(FakeAgentService::new());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));
    let primary = AgentId::new(PRIMARY);

    let mut stream = dispatcher
        .submit_streaming(MODEL, AgentRequest::from_text("one two three"), None)
        .await
        .unwrap();
    assert_eq!(stream.agent(), &primary);
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.content, "reply ");
    assert_eq!(dispatcher.in_flight(&primary), 1);

    drop(stream);
    assert_eq!(dispatcher.in_flight(&primary), 0);

    let stream = dispatcher
        .submit_streaming(MODEL, AgentRequest::from_text("again"), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let response = stream.into_response().await.unwrap();
    assert_eq!(response.content(), "reply to again");
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_unknown_model_is_rejected() {
    let service = Arc::new(FakeAgentService::new());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));

    let result = dispatcher
        .submit("gpt-5", AgentRequest::from_text("hello"), None)
        .await;
    assert!(matches!(result, Err(GatewayError::UnknownModel(ref model)) if model == "gpt-5"));
    assert_eq!(FakeAgentService::count(&service.sends), 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_queued_requests() {
    let service = Arc::new(FakeAgentService::holding());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));
    let primary = AgentId::new(PRIMARY);

    let busy = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .submit(MODEL, AgentRequest::from_text("long"), None)
                .await
        })
    };
    assert!(wait_until(|| dispatcher.in_flight(&primary) == 1).await);
    let queued = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .submit(MODEL, AgentRequest::from_text("waiting"), None)
                .await
        })
    };
    assert!(wait_until(|| dispatcher.queued(MODEL) == 1).await);

    dispatcher.shutdown().await;
    assert!(matches!(
        queued.await.unwrap(),
        Err(GatewayError::ShuttingDown)
    ));

    let late = dispatcher
        .submit(MODEL, AgentRequest::from_text("late"), None)
        .await;
    assert!(matches!(late, Err(GatewayError::ShuttingDown)));

    service.release(1);
    busy.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_abandoned_in_flight_call_completes_and_releases_agent() {
    let service = Arc::new(FakeAgentService::holding());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));
    let primary = AgentId::new(PRIMARY);

    let caller = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .submit(MODEL, AgentRequest::from_text("billed"), None)
                .await
        })
    };
    assert!(wait_until(|| FakeAgentService::count(&service.sends) == 1).await);
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    // The backend call keeps running and keeps its permit
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(dispatcher.in_flight(&primary), 1);

    service.release(1);
    assert!(wait_until(|| dispatcher.in_flight(&primary) == 0).await);
    assert_eq!(FakeAgentService::count(&service.sends), 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_out_of_range_timeout_is_an_error_not_a_crash() {
    let service = Arc::new(FakeAgentService::new());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));

    let caller = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .submit(
                    MODEL,
                    AgentRequest::from_text("forever"),
                    Some(Duration::from_secs(u64::MAX)),
                )
                .await
        })
    };
    let result = caller.await.unwrap();
    assert!(matches!(result, Err(GatewayError::ConfigError(_))));
    assert_eq!(dispatcher.queued(MODEL), 0);
    assert_eq!(FakeAgentService::count(&service.sends), 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_zero_timeout_uses_configured_queue_timeout() {
    let service = Arc::new(FakeAgentService::new());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));

    let reply = dispatcher
        .submit(MODEL, AgentRequest::from_text("now"), Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(reply.content(), "reply to now");
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_request_status_tracks_queue_position_and_agent() {
    let service = Arc::new(FakeAgentService::holding());
    let dispatcher = dispatcher(Arc::clone(&service), load_config(1));
    let primary = AgentId::new(PRIMARY);

    let mut handles = Vec::new();
    for (i, text) in ["first", "second", "third"].iter().enumerate() {
        let dispatcher_ref = Arc::clone(&dispatcher);
        let text = text.to_string();
        handles.push(tokio::spawn(async move {
            dispatcher_ref
                .submit_streaming(MODEL, AgentRequest::from_text(text), None)
                .await?
                .into_response()
                .await
        }));
        if i == 0 {
            assert!(wait_until(|| dispatcher.in_flight(&primary) == 1).await);
        } else {
            assert!(wait_until(|| dispatcher.queued(MODEL) == i).await);
        }
    }

    let waiting = dispatcher.waiting(MODEL);
    assert_eq!(waiting.len(), 2);
    assert_eq!(
        dispatcher.request_status(MODEL, waiting[1]),
        RequestStatus::Queued { position: 2 }
    );

    service.release(1);
    let processing = RequestStatus::Processing {
        agent: primary.clone(),
    };
    assert!(wait_until(|| dispatcher.request_status(MODEL, waiting[0]) == processing).await);
    assert_eq!(
        dispatcher.request_status(MODEL, waiting[1]),
        RequestStatus::Queued { position: 1 }
    );

    service.release(2);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(
        dispatcher.request_status(MODEL, waiting[0]),
        RequestStatus::Unknown
    );
    dispatcher.shutdown().await;
}
