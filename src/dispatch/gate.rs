//! Concurrency gate: per-identity admission control.
//!
//! Each identity owns a fair semaphore sized to `max_concurrent`, so the in-flight
//! count can never exceed the bound and blocked waiters are granted in FIFO order.
//! Permits are scoped: dropping a `GatePermit` releases it exactly once and wakes the
//! dispatch pump of the identity's logical model.

use crate::agent::AgentId;
use crate::error::GatewayError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

struct Slot {
    semaphore: Arc<Semaphore>,
    /// Woken whenever a permit for this identity is released
    on_release: Arc<Notify>,
}

/// Admission state keyed by identity id
pub struct ConcurrencyGate {
    max_concurrent: usize,
    slots: RwLock<HashMap<AgentId, Slot>>,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Make an identity admissible. Re-registering an id keeps its existing state.
    pub fn register(&self, agent: AgentId, on_release: Arc<Notify>) {
        let mut slots = self.slots.write();
        slots.entry(agent.clone()).or_insert_with(|| {
            debug!(agent_id = %agent, max_concurrent = self.max_concurrent, "Registered agent with gate");
            Slot {
                semaphore: Arc::new(Semaphore::new(self.max_concurrent)),
                on_release,
            }
        });
    }

    pub fn is_registered(&self, agent: &AgentId) -> bool {
        self.slots.read().contains_key(agent)
    }

    fn slot_handles(&self, agent: &AgentId) -> Option<(Arc<Semaphore>, Arc<Notify>)> {
        self.slots
            .read()
            .get(agent)
            .map(|slot| (Arc::clone(&slot.semaphore), Arc::clone(&slot.on_release)))
    }

    /// Wait until the identity has spare capacity, then take a permit.
    ///
    /// Dropping the returned future while waiting removes the waiter without
    /// touching the in-flight count.
    pub async fn acquire(&self, agent: &AgentId) -> Result<GatePermit, GatewayError> {
        let (semaphore, on_release) = self
            .slot_handles(agent)
            .ok_or_else(|| GatewayError::AgentUnavailable(agent.to_string()))?;

        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::AgentUnavailable(agent.to_string()))?;

        trace!(agent_id = %agent, "Gate permit acquired");
        Ok(GatePermit::new(agent.clone(), permit, on_release))
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self, agent: &AgentId) -> Option<GatePermit> {
        let (semaphore, on_release) = self.slot_handles(agent)?;
        let permit = semaphore.try_acquire_owned().ok()?;
        trace!(agent_id = %agent, "Gate permit acquired");
        Some(GatePermit::new(agent.clone(), permit, on_release))
    }

    /// Live in-flight count of an identity (0 when unknown)
    pub fn in_flight(&self, agent: &AgentId) -> usize {
        self.slots
            .read()
            .get(agent)
            .map(|slot| {
                self.max_concurrent
                    .saturating_sub(slot.semaphore.available_permits())
            })
            .unwrap_or(0)
    }

    /// Remove an identity if nothing is in flight on it.
    ///
    /// Claims every permit first, so no admission can slip in while the slot is torn
    /// down. Any waiters still parked on the slot fail with `AgentUnavailable`.
    pub fn retire_if_idle(&self, agent: &AgentId) -> bool {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get(agent) else {
            return false;
        };
        let Ok(all) = Arc::clone(&slot.semaphore).try_acquire_many_owned(self.max_concurrent as u32)
        else {
            return false;
        };
        if let Some(slot) = slots.remove(agent) {
            slot.semaphore.close();
        }
        drop(all);
        debug!(agent_id = %agent, "Removed idle agent from gate");
        true
    }
}

/// Scoped admission for one call on one identity
pub struct GatePermit {
    agent: AgentId,
    permit: Option<OwnedSemaphorePermit>,
    on_release: Arc<Notify>,
}

impl GatePermit {
    fn new(agent: AgentId, permit: OwnedSemaphorePermit, on_release: Arc<Notify>) -> Self {
        Self {
            agent,
            permit: Some(permit),
            on_release,
        }
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit").field("agent", &self.agent).finish()
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            // Release before waking so the woken pump sees the freed capacity
            drop(permit);
            trace!(agent_id = %self.agent, "Gate permit released");
            self.on_release.notify_one();
        }
    }
}
