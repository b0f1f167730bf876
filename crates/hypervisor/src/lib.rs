//! Hypervisor control plane: validates and boots heterogeneous VM
//! providers (microVM, emulator, container), enforces isolation and
//! network policy, tracks resource usage, and exposes everything
//! through one event bus that the audit bridge, health observer,
//! agent registry, and edge deployer all subscribe to.

pub mod agents;
pub mod audit;
pub mod backend;
pub mod config;
pub mod edge;
pub mod isolation;
pub mod monitor;
pub mod network;
pub mod observer;
pub mod sandbox;
pub mod verifier;
pub mod vsock;

pub use agents::{AgentConfigLoader, AgentDeployment, AgentOverrides, AgentRegistry, MoltbotDeployer};
pub use audit::{AppendOnlyStore, AuditBridge, InMemoryAppendOnlyStore};
pub use backend::{FirecrackerBackend, SimulatedBackend, VmBackend};
pub use config::{HostCapacity, ValidationReport, default_template, emit, parse, validate};
pub use edge::{EdgeDeployer, HalChecker, MetricsProvider, ReachabilityChecker, RemoteSpawner};
pub use isolation::IsolationManager;
pub use monitor::{ResourceMonitor, read_cgroup_snapshot};
pub use network::NetworkPolicyManager;
pub use observer::Observer;
pub use sandbox::{CleanupReport, SandboxEvent, SandboxManager};
pub use verifier::{ImageVerifier, VerificationResult};
pub use vsock::{InProcessDispatcher, TaskDispatcher, VsockChannel, VsockDispatcher};
