//! VM Spec and VM Instance

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HvError, HvResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Microvm,
    Emulator,
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    None,
    Process,
    Namespace,
    Vm,
    Ultra,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_millicores: u32,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub network_kbps: u32,
    pub max_processes: u32,
}

impl Resources {
    /// Every dimension of a [`Resources`] must be strictly positive.
    pub fn validate(&self) -> HvResult<()> {
        let dims = [
            ("cpu_millicores", self.cpu_millicores),
            ("memory_mb", self.memory_mb),
            ("disk_mb", self.disk_mb),
            ("network_kbps", self.network_kbps),
            ("max_processes", self.max_processes),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(HvError::validation(format!(
                    "resources.{name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drive {
    pub id: String,
    pub host_path: String,
    #[serde(default)]
    pub root: bool,
    #[serde(default)]
    pub read_only: bool,
}

/// Declarative creation request ("VM Spec").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VMSpec {
    pub name: String,
    pub provider: Provider,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_image: Option<String>,
    #[serde(default = "default_isolation_level")]
    pub isolation_level: IsolationLevel,
    pub resources: Resources,
    #[serde(default)]
    pub drives: Vec<Drive>,
    #[serde(default)]
    pub network_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,
}

fn default_isolation_level() -> IsolationLevel {
    IsolationLevel::Namespace
}

fn default_boot_timeout_ms() -> u64 {
    5_000
}

impl VMSpec {
    /// Structural invariants from independent of host capacity.
    pub fn validate(&self) -> HvResult<()> {
        if self.name.trim().is_empty() {
            return Err(HvError::validation("name must not be empty"));
        }
        if self.image.trim().is_empty() {
            return Err(HvError::validation("image must not be empty"));
        }
        self.resources.validate()?;

        let root_drives = self.drives.iter().filter(|d| d.root).count();
        if root_drives > 1 {
            return Err(HvError::validation(
                "at most one drive may be marked as root",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VMState {
    Creating,
    Running,
    Paused,
    Stopped,
    Destroyed,
    Error,
}

impl VMState {
    /// Valid transitions per the state machine in .
    pub fn can_transition_to(self, next: VMState) -> bool {
        use VMState::*;
        match (self, next) {
            (Creating, Running) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Running, Stopped) => true,
            (Stopped, Destroyed) => true,
            (Creating | Running | Paused | Stopped, Error) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VMState::Destroyed)
    }
}

/// Runtime record owned exclusively by the sandbox manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VMInstance {
    pub vm_id: Uuid,
    pub spec: VMSpec,
    pub state: VMState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl VMInstance {
    pub fn new(vm_id: Uuid, spec: VMSpec, created_at: DateTime<Utc>) -> Self {
        let resources = spec.resources;
        Self {
            vm_id,
            spec,
            state: VMState::Creating,
            created_at,
            started_at: None,
            stopped_at: None,
            resources,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VMSpec {
        VMSpec {
            name: "v1".into(),
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

    #[test]
    fn rejects_empty_name() {
        let mut s = spec();
        s.name = "".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_multiple_root_drives() {
        let mut s = spec();
        s.drives = vec![
            Drive {
                id: "a".into(),
                host_path: "/a".into(),
                root: true,
                read_only: false,
            },
            Drive {
                id: "b".into(),
                host_path: "/b".into(),
                root: true,
                read_only: false,
            },
        ];
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_nonpositive_resources() {
        let mut s = spec();
        s.resources.memory_mb = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn state_machine_transitions() {
        assert!(VMState::Creating.can_transition_to(VMState::Running));
        assert!(VMState::Running.can_transition_to(VMState::Paused));
        assert!(VMState::Paused.can_transition_to(VMState::Running));
        assert!(VMState::Running.can_transition_to(VMState::Stopped));
        assert!(VMState::Stopped.can_transition_to(VMState::Destroyed));
        assert!(!VMState::Destroyed.can_transition_to(VMState::Running));
        assert!(VMState::Creating.can_transition_to(VMState::Error));
        assert!(!VMState::Destroyed.can_transition_to(VMState::Error));
    }
}
