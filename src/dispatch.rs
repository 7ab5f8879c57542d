//! Dispatcher
//!
//! Load-management and request-lifecycle controller. A submitted request joins its
//! model's queue; the model's dispatch pump hands the queue head to the least-loaded
//! identity with spare gate capacity; the retry orchestrator then runs the backend call
//! while holding that identity's permit.
//!
//! Lock order: queue lane, then family, then gate. No lock is held across an await.

pub mod duplication;
pub mod gate;
pub mod queue;
pub mod retry;

pub use duplication::DuplicationController;
pub use gate::{ConcurrencyGate, GatePermit};
pub use queue::{Dispatch, PendingDispatch, RequestId, RequestQueue};
pub use retry::{AgentStream, CallMode, CallState, RetryOrchestrator};

use crate::agent::{AgentId, AgentIdentity, AgentRegistry};
use crate::error::GatewayError;
use crate::service::{AgentRequest, AgentResponse, AgentService};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Runtime load-management settings
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Maximum simultaneous calls per identity
    pub max_concurrent: usize,
    /// Family load (in flight + queued) above which a clone is provisioned
    pub duplication_threshold: usize,
    /// Default clone ceiling per family
    pub max_clones: usize,
    /// Maximum time a request may wait for an identity
    pub queue_timeout: Duration,
    /// How long load must stay below the threshold before idle clones are retired
    pub clone_cooldown: Duration,
    /// Period of the retirement sweep
    pub cleanup_interval: Duration,
    pub enable_auto_duplication: bool,
    pub retry_on_context_full: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            duplication_threshold: 8,
            max_clones: 3,
            queue_timeout: Duration::from_secs(300),
            clone_cooldown: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            enable_auto_duplication: true,
            retry_on_context_full: true,
        }
    }
}

/// Point-in-time load of one agent family
#[derive(Debug, Clone, Serialize)]
pub struct FamilyStats {
    pub model: String,
    pub primary: AgentId,
    pub clones: Vec<AgentId>,
    pub queued: usize,
    pub in_flight: usize,
    pub provisioning: bool,
    pub max_concurrent: usize,
}

/// Where a submitted request currently is
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting in its model's queue; position 1 is the head
    Queued { position: usize },
    /// Dispatched and running on an agent
    Processing { agent: AgentId },
    /// Finished, timed out, abandoned, or never seen
    Unknown,
}

type ActiveRequests = Arc<Mutex<HashMap<RequestId, AgentId>>>;

/// Lists a dispatched request as processing until dropped
pub(crate) struct ActiveRequest {
    request_id: RequestId,
    active: ActiveRequests,
}

impl ActiveRequest {
    fn register(active: &ActiveRequests, request_id: RequestId, agent: AgentId) -> Self {
        active.lock().insert(request_id, agent);
        Self {
            request_id,
            active: Arc::clone(active),
        }
    }

    pub(crate) fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.active.lock().remove(&self.request_id);
    }
}

/// Request dispatcher
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    gate: Arc<ConcurrencyGate>,
    queue: Arc<RequestQueue>,
    duplication: Arc<DuplicationController>,
    retry: Arc<RetryOrchestrator>,
    config: LoadConfig,
    active: ActiveRequests,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: Mutex<bool>,
}

impl Dispatcher {
    /// Wire the dispatcher for every family in `registry`
    pub fn new(
        registry: Arc<AgentRegistry>,
        service: Arc<dyn AgentService>,
        config: LoadConfig,
    ) -> Self {
        let gate = Arc::new(ConcurrencyGate::new(config.max_concurrent));
        let queue = Arc::new(RequestQueue::new());

        for model in registry.models() {
            let wake = queue.add_model(&model);
            for identity in registry.identities(&model) {
                gate.register(identity.id, Arc::clone(&wake));
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let duplication = Arc::new(DuplicationController::new(
            Arc::clone(&registry),
            Arc::clone(&gate),
            Arc::clone(&queue),
            Arc::clone(&service),
            config.clone(),
            shutdown_rx,
        ));
        let retry = Arc::new(RetryOrchestrator::new(
            service,
            config.retry_on_context_full,
        ));

        Self {
            registry,
            gate,
            queue,
            duplication,
            retry,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: Mutex::new(false),
        }
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Start one dispatch pump per logical model plus the retirement sweep
    pub fn start(&self) {
        let mut running = self.running.lock();
        if *running || *self.shutdown.borrow() {
            return;
        }
        *running = true;
        drop(running);

        let mut tasks = self.tasks.lock();
        for model in self.registry.models() {
            let Some(wake) = self.queue.waker(&model) else {
                continue;
            };
            let pump = Pump {
                model,
                registry: Arc::clone(&self.registry),
                gate: Arc::clone(&self.gate),
                queue: Arc::clone(&self.queue),
                duplication: Arc::clone(&self.duplication),
                wake,
            };
            tasks.push(tokio::spawn(pump.run(self.shutdown.subscribe())));
        }
        tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&self.duplication),
            self.config.cleanup_interval,
            self.shutdown.subscribe(),
        )));

        info!(
            models = self.registry.models().len(),
            max_concurrent = self.config.max_concurrent,
            duplication_threshold = self.config.duplication_threshold,
            "Started dispatcher"
        );
    }

    /// Stop pumps and the sweep; queued requests fail with `ShuttingDown`
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let drained = self.queue.close_all();
        *self.running.lock() = false;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for handle in tasks {
            let _ = handle.await;
        }
        info!(drained, "Stopped dispatcher");
    }

    async fn admit(
        &self,
        model: &str,
        request: AgentRequest,
        timeout: Option<Duration>,
        mode: CallMode,
    ) -> Result<AgentStream, GatewayError> {
        // A zero wait would expire before the pump could run
        let timeout = timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(self.config.queue_timeout);
        let pending = self.queue.enqueue(model, request, timeout)?;
        self.duplication.on_enqueue(model);

        let dispatch = pending.wait().await?;
        debug!(
            request_id = dispatch.request_id.as_u64(),
            model = %model,
            agent_id = %dispatch.agent.id,
            waited_ms = dispatch.waited.as_millis() as u64,
            "Request admitted"
        );
        let active = ActiveRequest::register(
            &self.active,
            dispatch.request_id,
            dispatch.agent.id.clone(),
        );
        Ok(self
            .retry
            .call(dispatch.agent, dispatch.request, mode, dispatch.permit)
            .tracked(active))
    }

    /// Submit a request and wait for the complete reply.
    ///
    /// Once admitted, the backend call runs on its own task: abandoning this future
    /// discards the reply but the call still completes and releases its permit.
    pub async fn submit(
        &self,
        model: &str,
        request: AgentRequest,
        timeout: Option<Duration>,
    ) -> Result<AgentResponse, GatewayError> {
        let stream = self
            .admit(model, request, timeout, CallMode::Buffered)
            .await?;
        tokio::spawn(stream.into_response())
            .await
            .map_err(|e| GatewayError::Backend(format!("Agent call task failed: {}", e)))?
    }

    /// Submit a request and consume the reply as a lazy chunk sequence.
    ///
    /// The permit is held until the sequence is exhausted or dropped.
    pub async fn submit_streaming(
        &self,
        model: &str,
        request: AgentRequest,
        timeout: Option<Duration>,
    ) -> Result<AgentStream, GatewayError> {
        self.admit(model, request, timeout, CallMode::Streaming).await
    }

    /// Live in-flight count of one identity
    pub fn in_flight(&self, agent: &AgentId) -> usize {
        self.gate.in_flight(agent)
    }

    /// Requests waiting on a logical model
    pub fn queued(&self, model: &str) -> usize {
        self.queue.len(model)
    }

    /// Ids of the requests waiting on a logical model, head first
    pub fn waiting(&self, model: &str) -> Vec<RequestId> {
        self.queue.waiting(model)
    }

    /// Queue position or serving agent of one request
    pub fn request_status(&self, model: &str, request_id: RequestId) -> RequestStatus {
        if let Some(position) = self.queue.position(model, request_id) {
            return RequestStatus::Queued { position };
        }
        match self.active.lock().get(&request_id) {
            Some(agent) => RequestStatus::Processing {
                agent: agent.clone(),
            },
            None => RequestStatus::Unknown,
        }
    }

    /// Load snapshot of every family
    pub fn stats(&self) -> Vec<FamilyStats> {
        self.registry
            .models()
            .into_iter()
            .filter_map(|model| {
                let family = self.registry.family(&model)?;
                let (primary, clones, provisioning) = {
                    let family = family.lock();
                    (
                        family.primary().id.clone(),
                        family
                            .clones()
                            .iter()
                            .map(|clone| clone.id.clone())
                            .collect::<Vec<_>>(),
                        family.is_provisioning(),
                    )
                };
                let in_flight = std::iter::once(&primary)
                    .chain(clones.iter())
                    .map(|id| self.gate.in_flight(id))
                    .sum();
                let queued = self.queue.len(&model);
                Some(FamilyStats {
                    model,
                    primary,
                    clones,
                    queued,
                    in_flight,
                    provisioning,
                    max_concurrent: self.config.max_concurrent,
                })
            })
            .collect()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.queue.close_all();
    }
}

/// Least-loaded identity with spare capacity, plus its permit
fn select_agent(
    registry: &AgentRegistry,
    gate: &ConcurrencyGate,
    model: &str,
) -> Option<(AgentIdentity, GatePermit)> {
    registry
        .rank_candidates(model, |id| gate.in_flight(id), gate.max_concurrent())
        .into_iter()
        .find_map(|identity| {
            // The gate has the final word; ranking may be stale by now
            gate.try_acquire(&identity.id)
                .map(|permit| (identity, permit))
        })
}

/// Per-model dispatch loop
struct Pump {
    model: String,
    registry: Arc<AgentRegistry>,
    gate: Arc<ConcurrencyGate>,
    queue: Arc<RequestQueue>,
    duplication: Arc<DuplicationController>,
    wake: Arc<Notify>,
}

impl Pump {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(model = %self.model, "Dispatch pump started");
        while !*shutdown.borrow() {
            let dispatched = self.queue.dispatch_ready(&self.model, || {
                select_agent(&self.registry, &self.gate, &self.model)
            });
            if dispatched > 0 {
                self.duplication.on_dequeue(&self.model);
            }

            // Woken on enqueue, permit release and new clones
            tokio::select! {
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(model = %self.model, "Dispatch pump stopped");
    }
}

async fn sweep_loop(
    duplication: Arc<DuplicationController>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    ticker.tick().await;

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {
                let retired = duplication.sweep().await;
                if retired > 0 {
                    debug!(retired, "Cleanup sweep finished");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
