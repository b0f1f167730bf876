//! Sandbox Manager (C7) — the heart of the control plane.
//!
//! Grounded on `firecracker-sdk`'s `Firecracker` lifecycle
//! (`ensure_not_started`, `pause`/`resume`, shutdown-and-cleanup on
//! `Drop`) generalized from one concrete microVM to the full VM table,
//! and on `engine::Engine::judge`'s
//! orchestrate-then-early-return async shape.

mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hv_types::error::{HvError, HvResult};
use hv_types::events::{SubscriptionHandle, Subscribers};
use hv_types::policy::{PolicyDecision, SandboxPolicy, no_policy_decision};
use hv_types::vm::{VMInstance, VMSpec, VMState};
use hv_types::vsock_wire::{TaskPayload, TaskResult};
use uuid::Uuid;

use crate::backend::VmBackend;
use crate::isolation::IsolationManager;
use crate::vsock::TaskDispatcher;

/// Payload shapes callers subscribe to. `PolicyEvaluated` is
/// not in the literal subscriber-contract list but is added here so
/// the audit bridge has something to turn into the `policy-evaluated`
/// audit event requires — see DESIGN.md.
#[derive(Debug, Clone)]
pub enum SandboxEvent {
    Ready,
    VmSpawned(VMInstance),
    VmTerminated {
        vm_id: Uuid,
        final_state: VMState,
    },
    VmStateChange {
        vm_id: Uuid,
        prev: VMState,
        next: VMState,
    },
    HealthWarning {
        message: String,
        error_count: u64,
    },
    SecurityViolation {
        vm_id: Uuid,
        reason: String,
    },
    Error {
        message: String,
        vm_id: Option<Uuid>,
    },
    PolicyEvaluated {
        agent_id: String,
        operation: String,
        decision: PolicyDecision,
    },
    TaskExecuted {
        vm_id: Uuid,
        task_id: Uuid,
        success: bool,
    },
}

#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub vm_id: Uuid,
    pub cleaned: bool,
    pub residual_files: Vec<String>,
    pub residual_processes: u32,
    pub verified_at: DateTime<Utc>,
}

pub struct SandboxManager {
    instances: Mutex<HashMap<Uuid, VMInstance>>,
    policies: Mutex<HashMap<String, SandboxPolicy>>,
    isolation: Arc<IsolationManager>,
    dispatcher: Arc<dyn TaskDispatcher>,
    backend: Arc<dyn VmBackend>,
    events: Subscribers<SandboxEvent>,
    max_concurrent_vms: usize,
    ready: AtomicBool,
    error_count: AtomicU64,
}

impl SandboxManager {
    pub fn new(
        max_concurrent_vms: usize,
        isolation: Arc<IsolationManager>,
        dispatcher: Arc<dyn TaskDispatcher>,
        backend: Arc<dyn VmBackend>,
    ) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            policies: Mutex::new(HashMap::new()),
            isolation,
            dispatcher,
            backend,
            events: Subscribers::new(),
            max_concurrent_vms,
            ready: AtomicBool::new(false),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&SandboxEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.events.unsubscribe(handle);
    }

    /// Marks the manager ready; callers must observe this event before
    /// calling [`SandboxManager::spawn`].
    pub async fn init(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.events.emit(&SandboxEvent::Ready);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn running_count(instances: &HashMap<Uuid, VMInstance>) -> usize {
        instances
            .values()
            .filter(|i| i.state == VMState::Running)
            .count()
    }

    fn advance(&self, vm_id: Uuid, next: VMState) -> HvResult<VMState> {
        let prev = {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(&vm_id)
                .ok_or_else(|| HvError::not_found(format!("vm {vm_id}")))?;
            state::transition(instance, next)?
        };
        self.events.emit(&SandboxEvent::VmStateChange {
            vm_id,
            prev,
            next,
        });
        Ok(prev)
    }

    fn fail(&self, vm_id: Uuid, message: String) {
        let marked = {
            let mut instances = self.instances.lock().unwrap();
            instances
                .get_mut(&vm_id)
                .and_then(|instance| state::mark_error(instance, message.clone()).ok())
        };
        if let Some(prev) = marked {
            self.events.emit(&SandboxEvent::VmStateChange {
                vm_id,
                prev,
                next: VMState::Error,
            });
        }
        self.error_count.fetch_add(1, Ordering::SeqCst);
        self.events.emit(&SandboxEvent::Error {
            message,
            vm_id: Some(vm_id),
        });
    }

    /// Pre-check: running count strictly below `max_concurrent_vms`,
    /// else `capacity-exceeded`. Validates the request, synthesizes
    /// `vm_id`, inserts in `creating`, obtains an isolation context
    /// from the isolation manager, and awaits the (timeout-bounded) backend boot.
    pub async fn spawn(&self, spec: VMSpec) -> HvResult<Uuid> {
        spec.validate()?;

        let vm_id = Uuid::new_v4();
        {
            let mut instances = self.instances.lock().unwrap();
            if Self::running_count(&instances) >= self.max_concurrent_vms {
                return Err(HvError::CapacityExceeded(format!(
                    "max_concurrent_vms ({}) reached",
                    self.max_concurrent_vms
                )));
            }
            instances.insert(vm_id, VMInstance::new(vm_id, spec.clone(), Utc::now()));
        }

        self.isolation.create_context(vm_id, spec.isolation_level);

        let booted = tokio::time::timeout(
            Duration::from_millis(spec.boot_timeout_ms),
            self.backend.boot(vm_id, &spec),
        )
        .await;

        match booted {
            Err(_) => {
                self.fail(vm_id, "boot timed out".into());
                return Err(HvError::Timeout(format!("vm {vm_id} boot timed out")));
            }
            Ok(Err(err)) => {
                self.fail(vm_id, err.to_string());
                return Err(err);
            }
            Ok(Ok(())) => {}
        }

        self.advance(vm_id, VMState::Running)?;

        let instance = self
            .instances
            .lock()
            .unwrap()
            .get(&vm_id)
            .cloned()
            .expect("instance inserted above");
        self.events.emit(&SandboxEvent::VmSpawned(instance));

        Ok(vm_id)
    }

    /// `running|paused|creating → stopped → destroyed`. Serialized by
    /// the instance-table lock, so concurrent callers racing on the
    /// same `vm_id` naturally produce at most one `vm-terminated`: the
    /// loser's first `advance` observes a state that can no longer
    /// reach `stopped` (or finds the entry already removed).
    pub async fn terminate(&self, vm_id: Uuid) -> HvResult<()> {
        self.advance(vm_id, VMState::Stopped)?;
        self.advance(vm_id, VMState::Destroyed)?;

        self.instances.lock().unwrap().remove(&vm_id);
        if let Err(err) = self.backend.shutdown(vm_id).await {
            tracing::warn!(%vm_id, %err, "backend shutdown failed during terminate");
        }
        if let Err(err) = self.isolation.destroy_context(vm_id) {
            tracing::warn!(%vm_id, %err, "isolation context cleanup failed during terminate");
        }

        self.events.emit(&SandboxEvent::VmTerminated {
            vm_id,
            final_state: VMState::Destroyed,
        });
        Ok(())
    }

    pub async fn pause(&self, vm_id: Uuid) -> HvResult<()> {
        self.backend.pause(vm_id).await?;
        self.advance(vm_id, VMState::Paused)?;
        Ok(())
    }

    pub async fn resume(&self, vm_id: Uuid) -> HvResult<()> {
        self.backend.resume(vm_id).await?;
        self.advance(vm_id, VMState::Running)?;
        Ok(())
    }

    pub fn get_status(&self, vm_id: Uuid) -> HvResult<VMInstance> {
        self.instances
            .lock()
            .unwrap()
            .get(&vm_id)
            .cloned()
            .ok_or_else(|| HvError::not_found(format!("vm {vm_id}")))
    }

    pub fn list(&self) -> Vec<VMInstance> {
        self.instances.lock().unwrap().values().cloned().collect()
    }

    /// Fails if `vm_id` is not `running`. Measures wall-clock duration
    /// around the dispatcher call regardless of what the dispatcher
    /// itself reports.
    pub async fn execute_task(&self, vm_id: Uuid, mut payload: TaskPayload) -> HvResult<TaskResult> {
        let instance = self.get_status(vm_id)?;
        if instance.state != VMState::Running {
            return Err(HvError::invalid_state(format!(
                "vm {vm_id} is not running"
            )));
        }

        payload.vm_id = vm_id.to_string();
        let task_id = payload.task_id;
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_millis(payload.timeout_ms),
            self.dispatcher.dispatch(vm_id, payload),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(mut result)) => {
                result.duration_ms = duration_ms;
                Ok(result)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(HvError::Timeout(format!("task {task_id} timed out"))),
        };

        self.events.emit(&SandboxEvent::TaskExecuted {
            vm_id,
            task_id,
            success: result.as_ref().is_ok_and(|r| r.success),
        });
        result
    }

    pub fn register_policy(&self, policy: SandboxPolicy) {
        self.policies
            .lock()
            .unwrap()
            .insert(policy.agent_id.clone(), policy);
    }

    /// Produces a `policy-evaluated` audit event on every call.
    pub fn evaluate_policy(&self, agent_id: &str, operation: &str) -> PolicyDecision {
        let decision = {
            let policies = self.policies.lock().unwrap();
            match policies.get(agent_id) {
                Some(policy) => policy.evaluate(operation),
                None => no_policy_decision(),
            }
        };

        self.events.emit(&SandboxEvent::PolicyEvaluated {
            agent_id: agent_id.to_string(),
            operation: operation.to_string(),
            decision: decision.clone(),
        });

        decision
    }

    /// Confirms no VM record is retained for `vm_id` after termination.
    pub fn verify_cleanup(&self, vm_id: Uuid) -> CleanupReport {
        let cleaned = !self.instances.lock().unwrap().contains_key(&vm_id);
        CleanupReport {
            vm_id,
            cleaned,
            residual_files: Vec::new(),
            residual_processes: 0,
            verified_at: Utc::now(),
        }
    }

    /// Best-effort terminate of every remaining VM; swallows per-VM
    /// errors so peers still shut down.
    pub async fn close(&self) {
        let remaining: Vec<Uuid> = self.instances.lock().unwrap().keys().copied().collect();
        for vm_id in remaining {
            if let Err(err) = self.terminate(vm_id).await {
                tracing::warn!(%vm_id, %err, "close: terminate failed, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::vsock::InProcessDispatcher;
    use hv_types::vm::{IsolationLevel, Provider, Resources};
    use std::sync::atomic::AtomicUsize;

    fn spec(name: &str) -> VMSpec {
        VMSpec {
            name: name.into(),
            provider: Provider::Container,
            image: "ubuntu".into(),
            kernel_image: None,
            isolation_level: IsolationLevel::Namespace,
            resources: Resources {
                cpu_millicores: 250,
                memory_mb: 128,
                disk_mb: 1024,
                network_kbps: 1024,
                max_processes: 32,
            },
            drives: vec![],
            network_enabled: false,
            agent_id: None,
            metadata: HashMap::new(),
            boot_timeout_ms: 5000,
        }
    }

    fn manager(max_concurrent_vms: usize) -> SandboxManager {
        SandboxManager::new(
            max_concurrent_vms,
            Arc::new(IsolationManager::default()),
            Arc::new(InProcessDispatcher),
            Arc::new(SimulatedBackend::new()),
        )
    }

    #[tokio::test]
    async fn spawn_then_list() {
        let mgr = manager(5);
        let ready_count = Arc::new(AtomicUsize::new(0));
        let rc = ready_count.clone();
        mgr.subscribe(move |e| {
            if matches!(e, SandboxEvent::Ready) {
                rc.fetch_add(1, Ordering::SeqCst);
            }
        });

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        mgr.subscribe(move |e| match e {
            SandboxEvent::VmStateChange { next, .. } => {
                o1.lock().unwrap().push(format!("state:{next:?}"))
            }
            SandboxEvent::VmSpawned(_) => o1.lock().unwrap().push("spawned".into()),
            _ => {}
        });

        mgr.init().await;
        let vm_id = mgr.spawn(spec("v1")).await.unwrap();

        assert_eq!(ready_count.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.list().len(), 1);
        assert_eq!(mgr.get_status(vm_id).unwrap().state, VMState::Running);

        let seen = order.lock().unwrap().clone();
        let state_idx = seen.iter().position(|s| s == "state:Running").unwrap();
        let spawned_idx = seen.iter().position(|s| s == "spawned").unwrap();
        assert!(state_idx < spawned_idx);
    }

    #[tokio::test]
    async fn capacity_rejects_third_spawn() {
        let mgr = manager(2);
        mgr.spawn(spec("v1")).await.unwrap();
        mgr.spawn(spec("v2")).await.unwrap();
        let err = mgr.spawn(spec("v3")).await.unwrap_err();
        assert_eq!(err.code(), "capacity-exceeded");
        assert_eq!(mgr.list().len(), 2);
    }

    #[tokio::test]
    async fn terminate_removes_and_cleans_up() {
        let mgr = manager(5);
        let vm_id = mgr.spawn(spec("v1")).await.unwrap();
        mgr.terminate(vm_id).await.unwrap();
        assert!(mgr.get_status(vm_id).is_err());
        assert!(mgr.verify_cleanup(vm_id).cleaned);
    }

    #[tokio::test]
    async fn pause_resume_round_trip() {
        let mgr = manager(5);
        let vm_id = mgr.spawn(spec("v1")).await.unwrap();
        mgr.pause(vm_id).await.unwrap();
        assert_eq!(mgr.get_status(vm_id).unwrap().state, VMState::Paused);
        mgr.resume(vm_id).await.unwrap();
        assert_eq!(mgr.get_status(vm_id).unwrap().state, VMState::Running);
    }

    #[tokio::test]
    async fn execute_task_requires_running() {
        let mgr = manager(5);
        let vm_id = mgr.spawn(spec("v1")).await.unwrap();
        mgr.pause(vm_id).await.unwrap();
        let payload = TaskPayload {
            task_id: Uuid::new_v4(),
            vm_id: vm_id.to_string(),
            command: "echo".into(),
            args: vec![],
            input: None,
            timeout_ms: 500,
        };
        let err = mgr.execute_task(vm_id, payload).await.unwrap_err();
        assert_eq!(err.code(), "invalid-state");
    }

    #[tokio::test]
    async fn execute_task_dispatches_when_running() {
        let mgr = manager(5);
        let vm_id = mgr.spawn(spec("v1")).await.unwrap();
        let payload = TaskPayload {
            task_id: Uuid::new_v4(),
            vm_id: vm_id.to_string(),
            command: "echo".into(),
            args: vec![],
            input: Some("hi".into()),
            timeout_ms: 500,
        };
        let result = mgr.execute_task(vm_id, payload).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn policy_evaluation_defaults_deny() {
        let mgr = manager(5);
        let decision = mgr.evaluate_policy("agent-1", "read");
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn close_terminates_remaining_vms() {
        let mgr = manager(5);
        mgr.spawn(spec("v1")).await.unwrap();
        mgr.spawn(spec("v2")).await.unwrap();
        mgr.close().await;
        assert!(mgr.list().is_empty());
    }
}
