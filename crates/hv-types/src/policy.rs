//! Sandbox Policy.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::vm::IsolationLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub agent_id: String,
    pub allowed_operations: Vec<String>,
    #[serde(default)]
    pub blocked_operations: HashSet<String>,
    #[serde(default)]
    pub network_capable: bool,
    #[serde(default)]
    pub filesystem_capable: bool,
    pub memory_ceiling_mb: u32,
    pub required_isolation_level: IsolationLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl SandboxPolicy {
    /// Policy evaluation rules from (registry lookup happens
    /// in the sandbox manager; this is the pure decision function).
    pub fn evaluate(&self, operation: &str) -> PolicyDecision {
        if self.blocked_operations.contains(operation) {
            return PolicyDecision {
                allowed: false,
                reason: format!("operation \"{operation}\" is blocked"),
            };
        }
        if !self.allowed_operations.iter().any(|op| op == operation) {
            return PolicyDecision {
                allowed: false,
                reason: format!("operation \"{operation}\" is not in the allow list"),
            };
        }
        PolicyDecision {
            allowed: true,
            reason: "allowed".into(),
        }
    }
}

pub fn no_policy_decision() -> PolicyDecision {
    PolicyDecision {
        allowed: false,
        reason: "no policy — default deny".into(),
    }
}
