//! Shared fixtures: an in-memory agent service with controllable latency and failures.

use async_trait::async_trait;
use futures::stream;
use librarian::agent::{AgentId, AgentIdentity, AgentRegistry};
use librarian::dispatch::{Dispatcher, LoadConfig};
use librarian::error::GatewayError;
use librarian::service::{AgentChunk, AgentRequest, AgentResponse, AgentService, ChunkStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const MODEL: &str = "gpt-4";
pub const PRIMARY: &str = "librarian-persona";

/// Agent service double.
///
/// When holding, every call parks until `release` hands out a permit, so tests can
/// pin requests in flight and observe queueing.
#[derive(Default)]
pub struct FakeAgentService {
    hold: Option<Arc<Semaphore>>,
    provision_delay: Duration,
    fail_provision: AtomicBool,
    context_full_sends: AtomicUsize,
    pub sends: AtomicUsize,
    pub summarizes: AtomicUsize,
    pub provisions: AtomicUsize,
    pub retires: AtomicUsize,
    active: Mutex<HashMap<AgentId, usize>>,
    peak: Mutex<HashMap<AgentId, usize>>,
    served: Mutex<Vec<(String, AgentId)>>,
}

impl FakeAgentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls park until released
    pub fn holding() -> Self {
        Self {
            hold: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = delay;
        self
    }

    /// The next `count` sends fail with a context overflow
    pub fn overflow_next(&self, count: usize) {
        self.context_full_sends.store(count, Ordering::SeqCst);
    }

    pub fn fail_provisioning(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    /// Let `count` parked calls finish
    pub fn release(&self, count: usize) {
        if let Some(hold) = &self.hold {
            hold.add_permits(count);
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn peak(&self, agent: &str) -> usize {
        self.peak
            .lock()
            .get(&AgentId::new(agent))
            .copied()
            .unwrap_or(0)
    }

    /// Message text of every call, in the order calls started
    pub fn served_messages(&self) -> Vec<String> {
        self.served.lock().iter().map(|(text, _)| text.clone()).collect()
    }

    pub fn served_by(&self) -> Vec<AgentId> {
        self.served.lock().iter().map(|(_, agent)| agent.clone()).collect()
    }

    async fn call(&self, agent: &AgentIdentity, request: &AgentRequest) -> Result<String, GatewayError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let text = request
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        {
            let mut active = self.active.lock();
            let now = active.entry(agent.id.clone()).or_insert(0);
            *now += 1;
            let mut peak = self.peak.lock();
            let best = peak.entry(agent.id.clone()).or_insert(0);
            *best = (*best).max(*now);
        }
        self.served.lock().push((text.clone(), agent.id.clone()));

        let overflow = self
            .context_full_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if !overflow {
            if let Some(hold) = &self.hold {
                if let Ok(permit) = hold.acquire().await {
                    permit.forget();
                }
            }
        }

        if let Some(now) = self.active.lock().get_mut(&agent.id) {
            *now -= 1;
        }

        if overflow {
            Err(GatewayError::ContextFull(
                "maximum context length exceeded".to_string(),
            ))
        } else {
            Ok(format!("reply to {}", text))
        }
    }
}

#[async_trait]
impl AgentService for FakeAgentService {
    async fn send(
        &self,
        agent: &AgentIdentity,
        request: &AgentRequest,
    ) -> Result<AgentResponse, GatewayError> {
        let text = self.call(agent, request).await?;
        Ok(AgentResponse::from_text(text))
    }

    async fn send_streaming(
        &self,
        agent: &AgentIdentity,
        request: &AgentRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let text = self.call(agent, request).await?;
        let chunks: Vec<Result<AgentChunk, GatewayError>> = text
            .split_inclusive(' ')
            .map(|piece| Ok(AgentChunk::assistant(piece)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn summarize(&self, _agent: &AgentIdentity) -> Result<(), GatewayError> {
        self.summarizes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn provision_clone(&self, source: &AgentIdentity) -> Result<AgentId, GatewayError> {
        let attempt = self.provisions.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.provision_delay.is_zero() {
            tokio::time::sleep(self.provision_delay).await;
        }
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(GatewayError::Provision("import rejected".to_string()));
        }
        Ok(AgentId::new(format!("{}-clone-{}", source.id, attempt)))
    }

    async fn retire(&self, _agent: &AgentIdentity) -> Result<(), GatewayError> {
        self.retires.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Load settings with auto-duplication off and short timers
pub fn load_config(max_concurrent: usize) -> LoadConfig {
    LoadConfig {
        max_concurrent,
        duplication_threshold: 100,
        max_clones: 0,
        queue_timeout: Duration::from_secs(10),
        clone_cooldown: Duration::from_secs(300),
        cleanup_interval: Duration::from_secs(60),
        enable_auto_duplication: false,
        retry_on_context_full: true,
    }
}

/// Started dispatcher serving one family: `MODEL` backed by `PRIMARY`
pub fn dispatcher(
    service: Arc<FakeAgentService>,
    config: LoadConfig,
) -> Arc<Dispatcher> {
    let registry = Arc::new(AgentRegistry::new());
    registry
        .register_family(MODEL, PRIMARY, config.max_clones)
        .unwrap();
    let dispatcher = Arc::new(Dispatcher::new(registry, service, config));
    dispatcher.start();
    dispatcher
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
