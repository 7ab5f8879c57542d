//! Retry Orchestrator
//!
//! Wraps one backend call on one identity:
//!
//! ```text
//! Calling --ok--> Succeeded
//! Calling --other error--> Failed
//! Calling --context full--> Summarizing --> Retrying --ok--> Succeeded
//!                                                   \--any error--> Failed
//! ```
//!
//! Buffered and streaming calls share this machine; a buffered reply is replayed as a
//! chunk sequence. The gate permit travels with the call and is released when the
//! sequence finishes, fails or is dropped.

use crate::agent::{AgentId, AgentIdentity};
use crate::dispatch::gate::GatePermit;
use crate::dispatch::queue::RequestId;
use crate::dispatch::ActiveRequest;
use crate::error::GatewayError;
use crate::service::{AgentChunk, AgentRequest, AgentResponse, AgentService, ChunkStream};
use futures::{stream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

/// How the backend is called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Wait for the complete reply
    Buffered,
    /// Consume the reply as it is produced
    Streaming,
}

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Calling,
    Summarizing,
    Retrying,
    Succeeded,
    Failed,
}

/// Runs backend calls with a single summarize-and-retry on context overflow
pub struct RetryOrchestrator {
    service: Arc<dyn AgentService>,
    retry_on_context_full: bool,
}

impl RetryOrchestrator {
    pub fn new(service: Arc<dyn AgentService>, retry_on_context_full: bool) -> Self {
        Self {
            service,
            retry_on_context_full,
        }
    }

    /// Start a call. Nothing is sent until the returned stream is polled.
    pub fn call(
        &self,
        agent: AgentIdentity,
        request: AgentRequest,
        mode: CallMode,
        permit: GatePermit,
    ) -> AgentStream {
        let agent_id = agent.id.clone();
        let cycle = CallCycle {
            service: Arc::clone(&self.service),
            agent,
            request,
            mode,
            retry_on_context_full: self.retry_on_context_full,
            state: CallState::Calling,
            current: None,
            delivered: 0,
            permit: Some(permit),
        };

        let inner = stream::unfold(cycle, |mut cycle| async move {
            let item = cycle.step().await?;
            Some((item, cycle))
        });

        AgentStream {
            agent: agent_id,
            request_id: None,
            _active: None,
            inner: Box::pin(inner),
        }
    }
}

struct CallCycle {
    service: Arc<dyn AgentService>,
    agent: AgentIdentity,
    request: AgentRequest,
    mode: CallMode,
    retry_on_context_full: bool,
    state: CallState,
    current: Option<ChunkStream>,
    /// Chunks already handed to the caller
    delivered: usize,
    permit: Option<GatePermit>,
}

async fn open(
    service: &Arc<dyn AgentService>,
    agent: &AgentIdentity,
    request: &AgentRequest,
    mode: CallMode,
) -> Result<ChunkStream, GatewayError> {
    match mode {
        CallMode::Buffered => {
            let response = service.send(agent, request).await?;
            Ok(Box::pin(stream::iter(response.chunks.into_iter().map(Ok))))
        }
        CallMode::Streaming => service.send_streaming(agent, request).await,
    }
}

impl CallCycle {
    fn finish(&mut self, state: CallState) {
        self.state = state;
        self.current = None;
        self.permit = None;
    }

    /// Decide what an error means in the current state. `None` means the cycle
    /// recovers and continues.
    fn on_error(&mut self, error: GatewayError) -> Option<GatewayError> {
        if !error.is_context_full() {
            debug!(agent_id = %self.agent.id, state = ?self.state, error = %error, "Agent call failed");
            self.finish(CallState::Failed);
            return Some(error);
        }

        let escalated = match self.state {
            CallState::Calling if self.delivered == 0 && self.retry_on_context_full => {
                warn!(agent_id = %self.agent.id, "Agent context window full, summarizing before retry");
                self.state = CallState::Summarizing;
                self.current = None;
                return None;
            }
            CallState::Calling if self.delivered > 0 => GatewayError::Backend(format!(
                "Context window full after {} chunks were delivered: {}",
                self.delivered, error
            )),
            CallState::Retrying => GatewayError::Backend(format!(
                "Context window still full after summarization: {}",
                error
            )),
            _ => GatewayError::Backend(error.to_string()),
        };
        warn!(agent_id = %self.agent.id, error = %escalated, "Context overflow not recovered");
        self.finish(CallState::Failed);
        Some(escalated)
    }

    async fn step(&mut self) -> Option<Result<AgentChunk, GatewayError>> {
        loop {
            match self.state {
                CallState::Succeeded | CallState::Failed => {
                    self.permit = None;
                    return None;
                }
                CallState::Summarizing => match self.service.summarize(&self.agent).await {
                    Ok(()) => {
                        info!(agent_id = %self.agent.id, "Agent conversation summarized, retrying once");
                        self.state = CallState::Retrying;
                    }
                    Err(error) => {
                        warn!(agent_id = %self.agent.id, error = %error, "Summarization failed");
                        self.finish(CallState::Failed);
                        return Some(Err(GatewayError::Backend(format!(
                            "Summarization failed after context overflow: {}",
                            error
                        ))));
                    }
                },
                CallState::Calling | CallState::Retrying => {
                    if self.current.is_none() {
                        match open(&self.service, &self.agent, &self.request, self.mode).await {
                            Ok(chunks) => self.current = Some(chunks),
                            Err(error) => match self.on_error(error) {
                                Some(error) => return Some(Err(error)),
                                None => continue,
                            },
                        }
                    }

                    let next = match self.current.as_mut() {
                        Some(chunks) => chunks.next().await,
                        None => continue,
                    };
                    match next {
                        Some(Ok(chunk)) => {
                            self.delivered += 1;
                            return Some(Ok(chunk));
                        }
                        Some(Err(error)) => match self.on_error(error) {
                            Some(error) => return Some(Err(error)),
                            None => continue,
                        },
                        None => {
                            debug!(
                                agent_id = %self.agent.id,
                                chunks = self.delivered,
                                retried = self.state == CallState::Retrying,
                                "Agent call completed"
                            );
                            self.finish(CallState::Succeeded);
                            return None;
                        }
                    }
                }
            }
        }
    }
}

/// Lazy sequence of chunks from one dispatched call.
///
/// Holds the call's gate permit; dropping the stream early releases it.
pub struct AgentStream {
    agent: AgentId,
    request_id: Option<RequestId>,
    /// Keeps the request listed as processing until the stream is gone
    _active: Option<ActiveRequest>,
    inner: Pin<Box<dyn Stream<Item = Result<AgentChunk, GatewayError>> + Send>>,
}

impl AgentStream {
    /// Identity serving this call
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Dispatcher request id, when the call came through the queue
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub(crate) fn tracked(mut self, active: ActiveRequest) -> Self {
        self.request_id = Some(active.request_id());
        self._active = Some(active);
        self
    }

    /// Drain the stream into a complete reply
    pub async fn into_response(mut self) -> Result<AgentResponse, GatewayError> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.inner.next().await {
            chunks.push(chunk?);
        }
        Ok(AgentResponse { chunks })
    }
}

impl Stream for AgentStream {
    type Item = Result<AgentChunk, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}
