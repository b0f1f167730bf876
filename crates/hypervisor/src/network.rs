//! Network Policy (C5)

use std::sync::Mutex;

use chrono::Utc;
use hv_types::events::Ring;
use hv_types::network::{
    Action, Direction, EvaluationResult, GLOBAL_VM, NetworkRequest, NetworkRule, PortRange,
    Protocol,
};
use uuid::Uuid;

const EVALUATION_LOG_CAPACITY: usize = 1000;

struct Inner {
    /// vm_id -> rules, always kept sorted ascending by priority.
    per_vm: std::collections::HashMap<String, Vec<NetworkRule>>,
    global: Vec<NetworkRule>,
    evaluation_log: Ring<EvaluationResult>,
}

pub struct NetworkPolicyManager {
    inner: Mutex<Inner>,
    default_action: Action,
}

impl NetworkPolicyManager {
    pub fn new(default_action: Action) -> Self {
        Self {
            inner: Mutex::new(Inner {
                per_vm: std::collections::HashMap::new(),
                global: Vec::new(),
                evaluation_log: Ring::new(EVALUATION_LOG_CAPACITY),
            }),
            default_action,
        }
    }

    /// Insert a rule into its owning list and re-sort that list
    /// ascending by priority (invariant).
    pub fn add_rule(&self, rule: NetworkRule) {
        let mut inner = self.inner.lock().unwrap();
        let list = if rule.vm_id == GLOBAL_VM {
            &mut inner.global
        } else {
            inner.per_vm.entry(rule.vm_id.clone()).or_default()
        };
        list.push(rule);
        list.sort_by_key(|r| r.priority);
    }

    pub fn remove_rule(&self, rule_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        inner.global.retain(|r| r.rule_id != rule_id);
        for list in inner.per_vm.values_mut() {
            list.retain(|r| r.rule_id != rule_id);
        }
    }

    /// Evaluation algorithm from : VM-specific rules first,
    /// then global rules, both already sorted ascending by priority;
    /// first match wins, otherwise fall back to `default_action`.
    pub fn evaluate(&self, request: &NetworkRequest) -> EvaluationResult {
        let mut inner = self.inner.lock().unwrap();

        let matched = {
            let per_vm = inner.per_vm.get(&request.vm_id);
            per_vm
                .into_iter()
                .flatten()
                .chain(inner.global.iter())
                .find(|rule| rule_matches(rule, request))
                .cloned()
        };

        let result = match matched {
            Some(rule) => EvaluationResult {
                allowed: rule.action == Action::Allow,
                matched_rule_id: Some(rule.rule_id),
                reason: format!("matched rule {}", rule.rule_id),
                evaluated_at: Utc::now(),
            },
            None => EvaluationResult {
                allowed: self.default_action == Action::Allow,
                matched_rule_id: None,
                reason: "no rule matched, applying default action".into(),
                evaluated_at: Utc::now(),
            },
        };

        inner.evaluation_log.push(result.clone());
        result
    }

    /// Install a single low-priority catch-all deny rule for `vm_id`.
    pub fn block_all(&self, vm_id: &str) {
        self.add_rule(catch_all(vm_id, Action::Deny));
    }

    /// Install a single low-priority catch-all allow rule for `vm_id`.
    pub fn allow_all(&self, vm_id: &str) {
        self.add_rule(catch_all(vm_id, Action::Allow));
    }

    pub fn rules_for(&self, vm_id: &str) -> Vec<NetworkRule> {
        self.inner
            .lock()
            .unwrap()
            .per_vm
            .get(vm_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn recent_evaluations(&self) -> Vec<EvaluationResult> {
        self.inner.lock().unwrap().evaluation_log.to_vec()
    }
}

fn catch_all(vm_id: &str, action: Action) -> NetworkRule {
    NetworkRule {
        rule_id: Uuid::new_v4(),
        vm_id: vm_id.to_string(),
        direction: Direction::Both,
        action,
        protocol: Protocol::Any,
        remote_host: None,
        port_range: None,
        priority: i64::MAX,
        created_at: Utc::now(),
    }
}

fn rule_matches(rule: &NetworkRule, request: &NetworkRequest) -> bool {
    direction_matches(rule.direction, request.direction)
        && protocol_matches(rule.protocol, request.protocol)
        && host_matches(rule.remote_host.as_deref(), &request.remote_host)
        && port_matches(rule.port_range, request.port)
}

fn direction_matches(rule: Direction, request: Direction) -> bool {
    rule == Direction::Both || rule == request
}

fn protocol_matches(rule: Protocol, request: Protocol) -> bool {
    rule == Protocol::Any || rule == request
}

fn port_matches(rule: Option<PortRange>, port: u16) -> bool {
    match rule {
        Some(range) => range.contains(port),
        None => true,
    }
}

/// Host match: exact equality, `*.suffix` suffix match, or a
/// three-octet CIDR prefix approximation (kept as the
/// documented simplification (see DESIGN.md's open-question notes).
fn host_matches(rule_host: Option<&str>, request_host: &str) -> bool {
    let Some(pattern) = rule_host else {
        return true;
    };

    if let Some(suffix) = pattern.strip_prefix("*.") {
        return request_host == suffix || request_host.ends_with(&format!(".{suffix}"));
    }

    if let Some(prefix) = pattern.strip_suffix("/24") {
        return three_octet_prefix(prefix) == three_octet_prefix(request_host);
    }

    pattern == request_host
}

fn three_octet_prefix(host: &str) -> String {
    host.splitn(4, '.').take(3).collect::<Vec<_>>().join(".")
}
