//! Request Queue
//!
//! One FIFO lane per logical model. Requests wait here until the lane's dispatch pump
//! hands them an identity and a gate permit, or until their deadline passes.
//!
//! Each entry carries a single-assignment result slot. The lane lock is the only place
//! entries are added, removed or answered, so a slot is filled at most once and a timed
//! out request is removed exactly once.

use crate::agent::AgentIdentity;
use crate::dispatch::gate::GatePermit;
use crate::error::GatewayError;
use crate::service::AgentRequest;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Request ID for tracking a request through the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Generate the next request ID
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RequestId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A dispatched request: the chosen identity plus the permit admitting it
#[derive(Debug)]
pub struct Dispatch {
    pub request_id: RequestId,
    pub agent: AgentIdentity,
    pub permit: GatePermit,
    pub request: AgentRequest,
    /// Time spent queued
    pub waited: Duration,
}

type ResultSlot = oneshot::Sender<Result<Dispatch, GatewayError>>;

/// A request waiting for an identity
struct QueuedRequest {
    request_id: RequestId,
    payload: AgentRequest,
    enqueued_at: Instant,
    deadline: Instant,
    result_slot: ResultSlot,
}

#[derive(Default)]
struct LaneState {
    entries: VecDeque<QueuedRequest>,
    closed: bool,
}

struct Lane {
    model: String,
    state: Mutex<LaneState>,
    /// Wakes the lane's dispatch pump
    wake: Arc<Notify>,
}

impl Lane {
    fn remove(&self, request_id: RequestId) -> bool {
        let mut state = self.state.lock();
        match state
            .entries
            .iter()
            .position(|entry| entry.request_id == request_id)
        {
            Some(index) => {
                state.entries.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Per-model FIFO request queue
pub struct RequestQueue {
    lanes: RwLock<HashMap<String, Arc<Lane>>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
        }
    }

    /// Create the lane for a logical model; returns its pump wakeup handle
    pub fn add_model(&self, model: &str) -> Arc<Notify> {
        let mut lanes = self.lanes.write();
        let lane = lanes.entry(model.to_string()).or_insert_with(|| {
            Arc::new(Lane {
                model: model.to_string(),
                state: Mutex::new(LaneState::default()),
                wake: Arc::new(Notify::new()),
            })
        });
        Arc::clone(&lane.wake)
    }

    fn lane(&self, model: &str) -> Option<Arc<Lane>> {
        self.lanes.read().get(model).cloned()
    }

    /// Pump wakeup handle of a lane
    pub fn waker(&self, model: &str) -> Option<Arc<Notify>> {
        self.lane(model).map(|lane| Arc::clone(&lane.wake))
    }

    /// Append a request to its model's lane. Returns immediately.
    pub fn enqueue(
        &self,
        model: &str,
        payload: AgentRequest,
        timeout: Duration,
    ) -> Result<PendingDispatch, GatewayError> {
        let lane = self
            .lane(model)
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))?;

        let request_id = RequestId::next();
        let enqueued_at = Instant::now();
        let deadline = enqueued_at.checked_add(timeout).ok_or_else(|| {
            GatewayError::ConfigError(format!("Queue timeout {:?} is out of range", timeout))
        })?;
        let (result_slot, receiver) = oneshot::channel();

        let queued = {
            let mut state = lane.state.lock();
            if state.closed {
                return Err(GatewayError::ShuttingDown);
            }
            state.entries.push_back(QueuedRequest {
                request_id,
                payload,
                enqueued_at,
                deadline,
                result_slot,
            });
            state.entries.len()
        };
        lane.wake.notify_one();

        debug!(
            request_id = request_id.as_u64(),
            model = %model,
            queued,
            "Enqueued request"
        );

        Ok(PendingDispatch {
            request_id,
            lane,
            enqueued_at,
            deadline,
            receiver,
            settled: false,
        })
    }

    /// Number of requests waiting on a lane
    pub fn len(&self, model: &str) -> usize {
        self.lane(model)
            .map(|lane| lane.state.lock().entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, model: &str) -> bool {
        self.len(model) == 0
    }

    /// 1-based place of a waiting request in its lane
    pub fn position(&self, model: &str, request_id: RequestId) -> Option<usize> {
        let lane = self.lane(model)?;
        let state = lane.state.lock();
        state
            .entries
            .iter()
            .position(|entry| entry.request_id == request_id)
            .map(|index| index + 1)
    }

    /// Ids of the requests waiting on a lane, head first
    pub fn waiting(&self, model: &str) -> Vec<RequestId> {
        self.lane(model)
            .map(|lane| {
                lane.state
                    .lock()
                    .entries
                    .iter()
                    .map(|entry| entry.request_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run `f` with the lane length while holding the lane lock, so nothing is
    /// dispatched or enqueued between the count and whatever `f` reads
    pub fn measure<R>(&self, model: &str, f: impl FnOnce(usize) -> R) -> Option<R> {
        let lane = self.lane(model)?;
        let state = lane.state.lock();
        Some(f(state.entries.len()))
    }

    /// Dispatch waiting requests in FIFO order.
    ///
    /// `select` is asked for an identity plus permit for the head request; the first
    /// time it has none, dispatch stops and the head keeps its place. Abandoned heads
    /// are dropped and expired heads are answered with `QueueTimeout`. Returns the
    /// number of requests dispatched.
    pub fn dispatch_ready<F>(&self, model: &str, mut select: F) -> usize
    where
        F: FnMut() -> Option<(AgentIdentity, GatePermit)>,
    {
        let Some(lane) = self.lane(model) else {
            return 0;
        };
        let mut state = lane.state.lock();
        let now = Instant::now();
        let mut dispatched = 0;

        while let Some(head) = state.entries.front() {
            if head.result_slot.is_closed() {
                state.entries.pop_front();
                continue;
            }

            if head.deadline <= now {
                if let Some(expired) = state.entries.pop_front() {
                    let waited_ms = now.duration_since(expired.enqueued_at).as_millis();
                    warn!(
                        request_id = expired.request_id.as_u64(),
                        model = %lane.model,
                        waited_ms = waited_ms as u64,
                        "Request timed out in queue"
                    );
                    let _ = expired.result_slot.send(Err(GatewayError::QueueTimeout {
                        model: lane.model.clone(),
                        waited_ms,
                    }));
                }
                continue;
            }

            let Some((agent, permit)) = select() else {
                break;
            };
            let Some(entry) = state.entries.pop_front() else {
                break;
            };

            let waited = now.duration_since(entry.enqueued_at);
            debug!(
                request_id = entry.request_id.as_u64(),
                model = %lane.model,
                agent_id = %agent.id,
                waited_ms = waited.as_millis() as u64,
                "Dispatched request"
            );
            let dispatch = Dispatch {
                request_id: entry.request_id,
                agent,
                permit,
                request: entry.payload,
                waited,
            };
            // A receiver dropped after the closed check hands the dispatch back; dropping
            // it releases the permit
            if entry.result_slot.send(Ok(dispatch)).is_ok() {
                dispatched += 1;
            }
        }

        dispatched
    }

    /// Close a lane: further enqueues fail and every waiter gets `ShuttingDown`
    pub fn close(&self, model: &str) -> usize {
        let Some(lane) = self.lane(model) else {
            return 0;
        };
        let drained: Vec<QueuedRequest> = {
            let mut state = lane.state.lock();
            state.closed = true;
            state.entries.drain(..).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.result_slot.send(Err(GatewayError::ShuttingDown));
        }
        lane.wake.notify_one();
        count
    }

    /// Close every lane
    pub fn close_all(&self) -> usize {
        let models: Vec<String> = self.lanes.read().keys().cloned().collect();
        models.iter().map(|model| self.close(model)).sum()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of a queued request.
///
/// Dropping it before dispatch removes the request from its lane with no other effect.
pub struct PendingDispatch {
    request_id: RequestId,
    lane: Arc<Lane>,
    enqueued_at: Instant,
    deadline: Instant,
    receiver: oneshot::Receiver<Result<Dispatch, GatewayError>>,
    settled: bool,
}

impl PendingDispatch {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait until the request is dispatched or its deadline passes
    pub async fn wait(mut self) -> Result<Dispatch, GatewayError> {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.receiver).await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ShuttingDown),
            Err(_) => {
                if self.lane.remove(self.request_id) {
                    let waited_ms = self.enqueued_at.elapsed().as_millis();
                    warn!(
                        request_id = self.request_id.as_u64(),
                        model = %self.lane.model,
                        waited_ms = waited_ms as u64,
                        "Request timed out in queue"
                    );
                    Err(GatewayError::QueueTimeout {
                        model: self.lane.model.clone(),
                        waited_ms,
                    })
                } else {
                    // Answered under the lane lock before we got it
                    match self.receiver.try_recv() {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::ShuttingDown),
                    }
                }
            }
        };
        self.settled = true;
        result
    }
}

impl Drop for PendingDispatch {
    fn drop(&mut self) {
        if !self.settled && self.lane.remove(self.request_id) {
            debug!(
                request_id = self.request_id.as_u64(),
                model = %self.lane.model,
                "Queued request abandoned"
            );
        }
    }
}
