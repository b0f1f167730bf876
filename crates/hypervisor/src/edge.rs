//! Edge Deployer (C11)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hv_types::error::{HvError, HvResult};
use hv_types::vm::VMSpec;
use uuid::Uuid;

#[async_trait]
pub trait ReachabilityChecker: Send + Sync {
    async fn is_reachable(&self, target: &str) -> HvResult<bool>;
}

#[async_trait]
pub trait HalChecker: Send + Sync {
    async fn has_hal(&self, target: &str) -> HvResult<bool>;
}

#[async_trait]
pub trait RemoteSpawner: Send + Sync {
    async fn spawn_remote(&self, target: &str, spec: &VMSpec) -> HvResult<Uuid>;
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn metrics(&self, target: &str) -> HvResult<HashMap<String, f64>>;
}

#[derive(Debug, Clone)]
pub struct TargetValidation {
    pub reachable: bool,
    pub hal_available: bool,
    pub target: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionStatus {
    Error,
    Spawned,
}

#[derive(Debug, Clone)]
pub struct ProvisionResult {
    pub status: ProvisionStatus,
    pub vm_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct QueuedOp {
    #[allow(dead_code)]
    op_id: Uuid,
    target_id: String,
    spec: VMSpec,
    #[allow(dead_code)]
    queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryReport {
    pub retried: usize,
    pub failed: usize,
}

pub struct EdgeDeployer {
    reachability_checker: Arc<dyn ReachabilityChecker>,
    hal_checker: Arc<dyn HalChecker>,
    remote_spawner: Arc<dyn RemoteSpawner>,
    metrics_provider: Arc<dyn MetricsProvider>,
    queue: Mutex<Vec<QueuedOp>>,
}

impl EdgeDeployer {
    pub fn new(
        reachability_checker: Arc<dyn ReachabilityChecker>,
        hal_checker: Arc<dyn HalChecker>,
        remote_spawner: Arc<dyn RemoteSpawner>,
        metrics_provider: Arc<dyn MetricsProvider>,
    ) -> Self {
        Self {
            reachability_checker,
            hal_checker,
            remote_spawner,
            metrics_provider,
            queue: Mutex::new(Vec::new()),
        }
    }

    pub async fn validate_target(&self, target: &str) -> TargetValidation {
        let reachable = match self.reachability_checker.is_reachable(target).await {
            Ok(reachable) => reachable,
            Err(err) => {
                return TargetValidation {
                    reachable: false,
                    hal_available: false,
                    target: target.to_string(),
                    error: Some(err.to_string()),
                };
            }
        };

        if !reachable {
            return TargetValidation {
                reachable: false,
                hal_available: false,
                target: target.to_string(),
                error: None,
            };
        }

        match self.hal_checker.has_hal(target).await {
            Ok(hal_available) => TargetValidation {
                reachable: true,
                hal_available,
                target: target.to_string(),
                error: None,
            },
            Err(err) => TargetValidation {
                reachable: true,
                hal_available: false,
                target: target.to_string(),
                error: Some(err.to_string()),
            },
        }
    }

    /// Validates the target; if unreachable, enqueues the op and
    /// returns status `Error` (spec scenario S6). If reachable but
    /// the HAL is absent, fails with `hal-unavailable`. Otherwise
    /// calls the remote spawner.
    pub async fn provision_remote(&self, target: &str, spec: VMSpec) -> HvResult<ProvisionResult> {
        let validation = self.validate_target(target).await;

        if !validation.reachable {
            self.queue.lock().unwrap().push(QueuedOp {
                op_id: Uuid::new_v4(),
                target_id: target.to_string(),
                spec,
                queued_at: Utc::now(),
            });
            return Ok(ProvisionResult {
                status: ProvisionStatus::Error,
                vm_id: None,
            });
        }

        if !validation.hal_available {
            return Err(HvError::HalUnavailable(format!(
                "target \"{target}\" has no HAL"
            )));
        }

        let vm_id = self.remote_spawner.spawn_remote(target, &spec).await?;
        Ok(ProvisionResult {
            status: ProvisionStatus::Spawned,
            vm_id: Some(vm_id),
        })
    }

    /// Attempts every queued op for `target`; ops that succeed are
    /// removed, the rest stay queued.
    pub async fn retry_queued(&self, target: &str) -> RetryReport {
        let ops: Vec<QueuedOp> = {
            let mut queue = self.queue.lock().unwrap();
            let mut matching = Vec::new();
            queue.retain(|op| {
                if op.target_id == target {
                    matching.push(op.clone());
                    false
                } else {
                    true
                }
            });
            matching
        };

        let mut report = RetryReport::default();
        let mut still_queued = Vec::new();
        for op in ops {
            let validation = self.validate_target(target).await;
            let outcome = if validation.reachable && validation.hal_available {
                self.remote_spawner.spawn_remote(target, &op.spec).await
            } else {
                Err(HvError::TargetUnreachable(target.to_string()))
            };

            match outcome {
                Ok(_) => report.retried += 1,
                Err(_) => {
                    report.failed += 1;
                    still_queued.push(op);
                }
            }
        }
        self.queue.lock().unwrap().extend(still_queued);
        report
    }

    pub fn queue_size(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub async fn metrics(&self, target: &str) -> HvResult<HashMap<String, f64>> {
        self.metrics_provider.metrics(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hv_types::vm::{IsolationLevel, Provider, Resources};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn spec() -> VMSpec {
        VMSpec {
            name: "edge-vm".into(),
            provider: Provider::Microvm,
            image: "img".into(),
            kernel_image: Some("vmlinux".into()),
            isolation_level: IsolationLevel::Vm,
            resources: Resources {
                cpu_millicores: 100,
                memory_mb: 64,
                disk_mb: 512,
                network_kbps: 512,
                max_processes: 16,
            },
            drives: vec![],
            network_enabled: true,
            agent_id: None,
            metadata: HashMap::new(),
            boot_timeout_ms: 5000,
        }
    }

    struct TogglingReachability {
        reachable: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ReachabilityChecker for TogglingReachability {
        async fn is_reachable(&self, _target: &str) -> HvResult<bool> {
            Ok(self.reachable.load(Ordering::SeqCst))
        }
    }

    struct AlwaysHal;
    #[async_trait]
    impl HalChecker for AlwaysHal {
        async fn has_hal(&self, _target: &str) -> HvResult<bool> {
            Ok(true)
        }
    }

    struct NeverHal;
    #[async_trait]
    impl HalChecker for NeverHal {
        async fn has_hal(&self, _target: &str) -> HvResult<bool> {
            Ok(false)
        }
    }

    struct StubSpawner;
    #[async_trait]
    impl RemoteSpawner for StubSpawner {
        async fn spawn_remote(&self, _target: &str, _spec: &VMSpec) -> HvResult<Uuid> {
            Ok(Uuid::new_v4())
        }
    }

    struct StubMetrics;
    #[async_trait]
    impl MetricsProvider for StubMetrics {
        async fn metrics(&self, _target: &str) -> HvResult<HashMap<String, f64>> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn unreachable_target_queues_and_reports_error_status() {
        let reachable = Arc::new(AtomicBool::new(false));
        let deployer = EdgeDeployer::new(
            Arc::new(TogglingReachability {
                reachable: reachable.clone(),
            }),
            Arc::new(AlwaysHal),
            Arc::new(StubSpawner),
            Arc::new(StubMetrics),
        );

        let result = deployer.provision_remote("t1", spec()).await.unwrap();
        assert_eq!(result.status, ProvisionStatus::Error);
        assert_eq!(deployer.queue_size(), 1);

        reachable.store(true, Ordering::SeqCst);
        let report = deployer.retry_queued("t1").await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(deployer.queue_size(), 0);
    }

    #[tokio::test]
    async fn reachable_without_hal_is_fatal() {
        let deployer = EdgeDeployer::new(
            Arc::new(TogglingReachability {
                reachable: Arc::new(AtomicBool::new(true)),
            }),
            Arc::new(NeverHal),
            Arc::new(StubSpawner),
            Arc::new(StubMetrics),
        );
        let err = deployer.provision_remote("t1", spec()).await.unwrap_err();
        assert_eq!(err.code(), "hal-unavailable");
        assert_eq!(deployer.queue_size(), 0);
    }

    #[tokio::test]
    async fn reachable_with_hal_spawns() {
        let deployer = EdgeDeployer::new(
            Arc::new(TogglingReachability {
                reachable: Arc::new(AtomicBool::new(true)),
            }),
            Arc::new(AlwaysHal),
            Arc::new(StubSpawner),
            Arc::new(StubMetrics),
        );
        let result = deployer.provision_remote("t1", spec()).await.unwrap();
        assert_eq!(result.status, ProvisionStatus::Spawned);
        assert!(result.vm_id.is_some());
    }

    #[tokio::test]
    async fn retry_keeps_failed_ops_queued() {
        let deployer = EdgeDeployer::new(
            Arc::new(TogglingReachability {
                reachable: Arc::new(AtomicBool::new(false)),
            }),
            Arc::new(AlwaysHal),
            Arc::new(StubSpawner),
            Arc::new(StubMetrics),
        );
        deployer.provision_remote("t1", spec()).await.unwrap();
        let report = deployer.retry_queued("t1").await;
        assert_eq!(report.retried, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(deployer.queue_size(), 1);
    }
}
