//! Duplication Controller
//!
//! Grows a family by one clone when its load (in flight plus queued) exceeds the
//! duplication threshold, and retires idle clones once load has stayed below the
//! threshold for the cool-down window.
//!
//! Provisioning runs on its own task so the triggering request never waits on it; the
//! family's in-progress flag keeps it to one operation per family at a time. A failed
//! attempt is logged and the family simply re-evaluates on the next qualifying enqueue.

use crate::agent::{AgentIdentity, AgentRegistry};
use crate::dispatch::gate::ConcurrencyGate;
use crate::dispatch::queue::RequestQueue;
use crate::dispatch::LoadConfig;
use crate::service::AgentService;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct DuplicationController {
    registry: Arc<AgentRegistry>,
    gate: Arc<ConcurrencyGate>,
    queue: Arc<RequestQueue>,
    service: Arc<dyn AgentService>,
    config: LoadConfig,
    shutdown: watch::Receiver<bool>,
}

impl DuplicationController {
    pub fn new(
        registry: Arc<AgentRegistry>,
        gate: Arc<ConcurrencyGate>,
        queue: Arc<RequestQueue>,
        service: Arc<dyn AgentService>,
        config: LoadConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            gate,
            queue,
            service,
            config,
            shutdown,
        }
    }

    /// In-flight plus queued requests for a family, counted under the lane lock
    pub fn family_load(&self, model: &str, identities: &[AgentIdentity]) -> usize {
        self.queue
            .measure(model, |queued| {
                queued
                    + identities
                        .iter()
                        .map(|identity| self.gate.in_flight(&identity.id))
                        .sum::<usize>()
            })
            .unwrap_or(0)
    }

    /// Re-measure a family's load and update its quiet-period tracking
    fn observe(&self, model: &str) -> Option<usize> {
        let family = self.registry.family(model)?;
        let identities = self.registry.identities(model);
        let load = self.family_load(model, &identities);
        family
            .lock()
            .observe_load(load, self.config.duplication_threshold, Instant::now());
        Some(load)
    }

    /// Evaluate duplication after a request joined the model's queue
    pub fn on_enqueue(self: &Arc<Self>, model: &str) {
        let Some(family) = self.registry.family(model) else {
            return;
        };
        let identities = self.registry.identities(model);
        let load = self.family_load(model, &identities);
        let threshold = self.config.duplication_threshold;

        let source = {
            let mut family = family.lock();
            family.observe_load(load, threshold, Instant::now());
            if !self.config.enable_auto_duplication || load <= threshold {
                return;
            }
            if !family.begin_provisioning() {
                debug!(
                    model = %model,
                    load,
                    clones = family.clones().len(),
                    "Duplication threshold exceeded but provisioning already running or at ceiling"
                );
                return;
            }
            family.primary().clone()
        };

        info!(
            model = %model,
            load,
            threshold,
            source_agent = %source.id,
            "Load above duplication threshold, provisioning clone"
        );
        let controller = Arc::clone(self);
        let model = model.to_string();
        tokio::spawn(async move {
            controller.provision(&model, source).await;
        });
    }

    /// Track load after requests left the model's queue
    pub fn on_dequeue(&self, model: &str) {
        if let Some(load) = self.observe(model) {
            debug!(model = %model, load, "Family load after dispatch");
        }
    }

    async fn provision(&self, model: &str, source: AgentIdentity) {
        let started = Instant::now();
        let result = self.service.provision_clone(&source).await;

        let Some(family) = self.registry.family(model) else {
            return;
        };
        match result {
            Ok(clone_id) if *self.shutdown.borrow() => {
                family.lock().finish_provisioning(None);
                info!(model = %model, agent_id = %clone_id, "Gateway shutting down, discarding new clone");
                let clone = AgentIdentity::clone_of(clone_id.clone());
                if let Err(error) = self.service.retire(&clone).await {
                    warn!(agent_id = %clone_id, error = %error, "Failed to discard clone");
                }
            }
            Ok(clone_id) => {
                let Some(wake) = self.queue.waker(model) else {
                    family.lock().finish_provisioning(None);
                    return;
                };
                // Admissible in the gate before it becomes selectable in the family
                self.gate.register(clone_id.clone(), Arc::clone(&wake));
                let clone = AgentIdentity::clone_of(clone_id.clone());
                let added = family.lock().finish_provisioning(Some(clone.clone()));

                if added {
                    info!(
                        model = %model,
                        agent_id = %clone_id,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Clone provisioned"
                    );
                    wake.notify_one();
                } else {
                    warn!(model = %model, agent_id = %clone_id, "Family full, discarding new clone");
                    self.gate.retire_if_idle(&clone_id);
                    if let Err(error) = self.service.retire(&clone).await {
                        warn!(agent_id = %clone_id, error = %error, "Failed to discard clone");
                    }
                }
            }
            Err(error) => {
                family.lock().finish_provisioning(None);
                warn!(
                    model = %model,
                    source_agent = %source.id,
                    error = %error,
                    "Clone provisioning failed"
                );
            }
        }
    }

    /// Retire idle clones of families that stayed below the threshold for the whole
    /// cool-down window. Newest clones go first. Returns the number retired.
    pub async fn sweep(&self) -> usize {
        let cooldown = self.config.clone_cooldown;
        let threshold = self.config.duplication_threshold;
        let mut retired = 0;

        for model in self.registry.models() {
            let Some(family) = self.registry.family(&model) else {
                continue;
            };
            let identities = self.registry.identities(&model);
            let load = self.family_load(&model, &identities);
            let now = Instant::now();

            let candidates: Vec<AgentIdentity> = {
                let mut family = family.lock();
                family.observe_load(load, threshold, now);
                match family.below_threshold_for(now) {
                    Some(quiet) if quiet >= cooldown => family
                        .clones()
                        .iter()
                        .rev()
                        .filter(|clone| {
                            clone
                                .created_at
                                .map(|created| now.saturating_duration_since(created) >= cooldown)
                                .unwrap_or(false)
                        })
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                }
            };

            for clone in candidates {
                if !self.gate.retire_if_idle(&clone.id) {
                    debug!(model = %model, agent_id = %clone.id, "Clone busy, keeping it");
                    continue;
                }
                family.lock().remove_clone(&clone.id);
                info!(model = %model, agent_id = %clone.id, load, "Retired idle clone");
                if let Err(error) = self.service.retire(&clone).await {
                    warn!(agent_id = %clone.id, error = %error, "Agent service failed to discard clone");
                }
                retired += 1;
            }
        }

        retired
    }
}
