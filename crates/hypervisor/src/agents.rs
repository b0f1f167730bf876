//! Agent Registry & Moltbot Deployer (C10)
//!
//! "Unknown agent" surfaces as `HvError::NotFound` from the registry;
//! "VM lifecycle failure" surfaces as whatever code the sandbox
//! manager returned (`capacity-exceeded`, `timeout`, ...). The shared
//! closed taxonomy already lets callers distinguish the two
//! by `.code()`, so no deployer-specific error type is introduced —
//! see DESIGN.md.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hv_types::error::{HvError, HvResult};
use hv_types::vm::{Resources, VMSpec, VMState};
use uuid::Uuid;

use crate::sandbox::SandboxManager;

#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub image: Option<String>,
    pub resources: Option<Resources>,
    pub network_enabled: Option<bool>,
    pub metadata: HashMap<String, String>,
}

/// `(agent_name, overrides?) -> VMSpec`.
#[async_trait]
pub trait AgentConfigLoader: Send + Sync {
    async fn load(&self, agent_name: &str, overrides: Option<&AgentOverrides>) -> HvResult<VMSpec>;
}

#[derive(Debug, Clone)]
pub struct AgentDeployment {
    pub agent_name: String,
    pub vm_id: Uuid,
    pub spec: VMSpec,
    pub deployed_at: DateTime<Utc>,
    pub status: VMState,
}

#[derive(Default)]
pub struct AgentRegistry {
    entries: Mutex<HashMap<String, AgentDeployment>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, deployment: AgentDeployment) -> HvResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&deployment.agent_name) {
            return Err(HvError::validation(format!(
                "agent \"{}\" is already registered",
                deployment.agent_name
            )));
        }
        entries.insert(deployment.agent_name.clone(), deployment);
        Ok(())
    }

    pub fn upsert(&self, deployment: AgentDeployment) {
        self.entries
            .lock()
            .unwrap()
            .insert(deployment.agent_name.clone(), deployment);
    }

    pub fn unregister(&self, agent_name: &str) {
        self.entries.lock().unwrap().remove(agent_name);
    }

    pub fn get(&self, agent_name: &str) -> HvResult<AgentDeployment> {
        self.entries
            .lock()
            .unwrap()
            .get(agent_name)
            .cloned()
            .ok_or_else(|| HvError::not_found(format!("agent \"{agent_name}\"")))
    }

    pub fn list(&self) -> Vec<AgentDeployment> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}

/// Composes the registry with the sandbox manager.
pub struct MoltbotDeployer {
    registry: AgentRegistry,
    sandbox: Arc<SandboxManager>,
    loader: Arc<dyn AgentConfigLoader>,
}

impl MoltbotDeployer {
    pub fn new(sandbox: Arc<SandboxManager>, loader: Arc<dyn AgentConfigLoader>) -> Self {
        Self {
            registry: AgentRegistry::new(),
            sandbox,
            loader,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Loads a base spec via the injected loader, spawns via C7, reads
    /// the resulting instance state, and upserts the registration.
    pub async fn deploy_agent(
        &self,
        agent_name: &str,
        overrides: Option<&AgentOverrides>,
    ) -> HvResult<AgentDeployment> {
        let spec = self.loader.load(agent_name, overrides).await?;
        let vm_id = self.sandbox.spawn(spec.clone()).await?;
        let instance = self.sandbox.get_status(vm_id)?;

        let deployment = AgentDeployment {
            agent_name: agent_name.to_string(),
            vm_id,
            spec,
            deployed_at: Utc::now(),
            status: instance.state,
        };
        self.registry.upsert(deployment.clone());
        Ok(deployment)
    }

    pub async fn undeploy_agent(&self, agent_name: &str) -> HvResult<()> {
        let deployment = self.registry.get(agent_name)?;
        self.sandbox.terminate(deployment.vm_id).await?;
        self.registry.unregister(agent_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::isolation::IsolationManager;
    use crate::vsock::InProcessDispatcher;
    use hv_types::vm::{IsolationLevel, Provider};

    fn base_spec(name: &str) -> VMSpec {
        VMSpec {
            name: name.into(),
            provider: Provider::Container,
            image: "base-image".into(),
            kernel_image: None,
            isolation_level: IsolationLevel::Namespace,
            resources: Resources {
                cpu_millicores: 100,
                memory_mb: 64,
                disk_mb: 512,
                network_kbps: 512,
                max_processes: 16,
            },
            drives: vec![],
            network_enabled: false,
            agent_id: Some(name.to_string()),
            metadata: HashMap::new(),
            boot_timeout_ms: 5000,
        }
    }

    struct StubLoader;

    #[async_trait]
    impl AgentConfigLoader for StubLoader {
        async fn load(
            &self,
            agent_name: &str,
            overrides: Option<&AgentOverrides>,
        ) -> HvResult<VMSpec> {
            let mut spec = base_spec(agent_name);
            if let Some(overrides) = overrides
                && let Some(image) = &overrides.image
            {
                spec.image = image.clone();
            }
            Ok(spec)
        }
    }

    fn deployer() -> MoltbotDeployer {
        let sandbox = Arc::new(SandboxManager::new(
            5,
            Arc::new(IsolationManager::default()),
            Arc::new(InProcessDispatcher),
            Arc::new(SimulatedBackend::new()),
        ));
        MoltbotDeployer::new(sandbox, Arc::new(StubLoader))
    }

    #[tokio::test]
    async fn deploy_registers_and_spawns() {
        let deployer = deployer();
        let deployment = deployer.deploy_agent("agent-1", None).await.unwrap();
        assert_eq!(deployment.status, VMState::Running);
        assert_eq!(deployer.registry().get("agent-1").unwrap().vm_id, deployment.vm_id);
    }

    #[tokio::test]
    async fn deploy_applies_overrides() {
        let deployer = deployer();
        let overrides = AgentOverrides {
            image: Some("custom-image".into()),
            ..Default::default()
        };
        let deployment = deployer
            .deploy_agent("agent-1", Some(&overrides))
            .await
            .unwrap();
        assert_eq!(deployment.spec.image, "custom-image");
    }

    #[tokio::test]
    async fn undeploy_terminates_and_unregisters() {
        let deployer = deployer();
        deployer.deploy_agent("agent-1", None).await.unwrap();
        deployer.undeploy_agent("agent-1").await.unwrap();
        assert!(deployer.registry().get("agent-1").is_err());
    }

    #[tokio::test]
    async fn undeploy_unknown_agent_is_not_found() {
        let deployer = deployer();
        let err = deployer.undeploy_agent("ghost").await.unwrap_err();
        assert_eq!(err.code(), "not-found");
    }

    #[test]
    fn register_rejects_duplicate() {
        let registry = AgentRegistry::new();
        let deployment = AgentDeployment {
            agent_name: "a1".into(),
            vm_id: Uuid::new_v4(),
            spec: base_spec("a1"),
            deployed_at: Utc::now(),
            status: VMState::Running,
        };
        registry.register(deployment.clone()).unwrap();
        assert!(registry.register(deployment).is_err());
    }
}
