//! Isolation Context.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::vm::IsolationLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Pid,
    Net,
    Ipc,
    Mnt,
    Uts,
    User,
    Cgroup,
}

/// Closed set of Linux-style capability tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    ChownFiles,
    BindLowPorts,
    KillProcess,
    SysAdmin,
    NetAdmin,
    SysPtrace,
    SetUidGid,
    MountFilesystems,
    SysBoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Active,
    Suspended,
    Destroyed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationContext {
    pub vm_id: Uuid,
    pub isolation_level: IsolationLevel,
    pub namespaces: HashSet<Namespace>,
    pub capabilities: HashSet<Capability>,
    pub cgroup_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_ids: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub state: ContextState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Recorded when [`enforce_capability`](crate) fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityViolation {
    pub vm_id: Uuid,
    pub capability: Capability,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub severity: ViolationSeverity,
}

/// Namespace/capability set determined by isolation level (table).
pub fn namespaces_for(level: IsolationLevel) -> HashSet<Namespace> {
    use Namespace::*;
    match level {
        IsolationLevel::None => HashSet::new(),
        IsolationLevel::Process => HashSet::from([Pid]),
        IsolationLevel::Namespace => HashSet::from([Pid, Net, Ipc, Mnt, Uts]),
        IsolationLevel::Vm | IsolationLevel::Ultra => {
            HashSet::from([Pid, Net, Ipc, Mnt, Uts, User, Cgroup])
        }
    }
}

pub fn capabilities_for(level: IsolationLevel) -> HashSet<Capability> {
    use Capability::*;
    match level {
        IsolationLevel::None => HashSet::from([
            ChownFiles,
            BindLowPorts,
            KillProcess,
            SysAdmin,
            NetAdmin,
            SysPtrace,
            SetUidGid,
            MountFilesystems,
            SysBoot,
        ]),
        IsolationLevel::Process => HashSet::from([ChownFiles, BindLowPorts, KillProcess]),
        IsolationLevel::Namespace => HashSet::from([ChownFiles, BindLowPorts]),
        IsolationLevel::Vm => HashSet::from([BindLowPorts]),
        IsolationLevel::Ultra => HashSet::new(),
    }
}

/// Severity derived from isolation level for capability violations:
/// ultra→critical, vm→high, namespace→medium, else→low.
pub fn violation_severity_for(level: IsolationLevel) -> ViolationSeverity {
    match level {
        IsolationLevel::Ultra => ViolationSeverity::Critical,
        IsolationLevel::Vm => ViolationSeverity::High,
        IsolationLevel::Namespace => ViolationSeverity::Medium,
        IsolationLevel::None | IsolationLevel::Process => ViolationSeverity::Low,
    }
}
