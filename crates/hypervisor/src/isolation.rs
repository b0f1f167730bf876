//! Isolation Manager (C4)
//!
//! Namespace/capability enforcement is grounded on
//! `seccomp::SeccompFilter` (allow/deny syscall-filter construction)
//! and cgroup path bookkeeping on `handler::HandlerError::CgroupError`.
//! All operations here are synchronous: isolation context lookups
//! never block on I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use hv_types::error::{HvError, HvResult};
use hv_types::events::{Ring, SubscriptionHandle, Subscribers};
use hv_types::isolation::{
    Capability, CapabilityViolation, ContextState, IsolationContext, Namespace,
    capabilities_for, namespaces_for, violation_severity_for,
};
use hv_types::vm::IsolationLevel;
use libseccomp::{ScmpAction, ScmpFilterContext, ScmpSyscall};
use uuid::Uuid;

/// Syscalls a namespace/process-level context denies, mirroring the
/// teacher's `seccomp::SeccompFilter::apply_basic_filter` blocklist.
/// The resulting filter is only *constructed* here — host-side
/// isolation setup validates the profile compiles for this level; it
/// is loaded into the sandboxed child's context at exec time by the
/// (out-of-scope) process spawner, never into the hypervisor's own
/// process.
fn build_seccomp_profile(level: IsolationLevel) -> Result<ScmpFilterContext, libseccomp::error::SeccompError> {
    let mut filter = ScmpFilterContext::new(ScmpAction::Allow)?;
    let blocked: &[&str] = match level {
        IsolationLevel::None => &[],
        IsolationLevel::Process => &["mount", "umount2", "pivot_root", "reboot", "kexec_load"],
        IsolationLevel::Namespace | IsolationLevel::Vm | IsolationLevel::Ultra => &[
            "mount",
            "umount2",
            "pivot_root",
            "reboot",
            "kexec_load",
            "ptrace",
            "process_vm_writev",
            "setuid",
            "setgid",
            "capset",
        ],
    };
    for syscall in blocked {
        if let Ok(syscall) = ScmpSyscall::from_name(syscall) {
            filter.add_rule(ScmpAction::Errno(libc::EPERM), syscall)?;
        }
    }
    Ok(filter)
}

fn ensure_cgroup(path: &str) {
    let hier = cgroups_rs::fs::hierarchies::auto();
    match cgroups_rs::fs::Cgroup::new(hier, path) {
        Ok(_cgroup) => tracing::debug!(path, "cgroup ensured"),
        Err(err) => tracing::warn!(path, %err, "failed to create cgroup, continuing without it"),
    }
}

fn remove_cgroup(path: &str) {
    let hier = cgroups_rs::fs::hierarchies::auto();
    if let Ok(cgroup) = cgroups_rs::fs::Cgroup::new(hier, path)
        && let Err(err) = cgroup.delete()
    {
        tracing::warn!(path, %err, "failed to remove cgroup");
    }
}

const VIOLATION_RING_CAPACITY: usize = 1000;

struct Inner {
    contexts: HashMap<Uuid, IsolationContext>,
    violations: Ring<CapabilityViolation>,
}

pub struct IsolationManager {
    inner: Mutex<Inner>,
    subscribers: Subscribers<CapabilityViolation>,
    cgroup_root: String,
}

impl Default for IsolationManager {
    fn default() -> Self {
        Self::new("/sys/fs/cgroup/hypervisor".to_string())
    }
}

impl IsolationManager {
    pub fn new(cgroup_root: String) -> Self {
        Self {
            inner: Mutex::new(Inner {
                contexts: HashMap::new(),
                violations: Ring::new(VIOLATION_RING_CAPACITY),
            }),
            subscribers: Subscribers::new(),
            cgroup_root,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&CapabilityViolation) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(listener)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers.unsubscribe(handle);
    }

    /// Idempotent: returns the existing context if one is already
    /// present for `vm_id`.
    pub fn create_context(&self, vm_id: Uuid, level: IsolationLevel) -> IsolationContext {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.contexts.get(&vm_id) {
            return existing.clone();
        }
        let cgroup_path = format!("{}/{}", self.cgroup_root, vm_id);
        ensure_cgroup(&cgroup_path);
        if let Err(err) = build_seccomp_profile(level) {
            tracing::warn!(%vm_id, %err, "failed to build seccomp profile");
        }

        let context = IsolationContext {
            vm_id,
            isolation_level: level,
            namespaces: namespaces_for(level),
            capabilities: capabilities_for(level),
            cgroup_path,
            namespace_ids: None,
            created_at: Utc::now(),
            state: ContextState::Active,
        };
        inner.contexts.insert(vm_id, context.clone());
        context
    }

    pub fn destroy_context(&self, vm_id: Uuid) -> HvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let context = inner
            .contexts
            .get_mut(&vm_id)
            .ok_or_else(|| HvError::not_found(format!("isolation context for {vm_id}")))?;
        context.state = ContextState::Destroyed;
        let cgroup_path = context.cgroup_path.clone();
        inner.contexts.remove(&vm_id);
        drop(inner);
        remove_cgroup(&cgroup_path);
        Ok(())
    }

    pub fn suspend_context(&self, vm_id: Uuid) -> HvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let context = inner
            .contexts
            .get_mut(&vm_id)
            .ok_or_else(|| HvError::not_found(format!("isolation context for {vm_id}")))?;
        if context.state != ContextState::Active {
            return Err(HvError::invalid_state("context is not active"));
        }
        context.state = ContextState::Suspended;
        Ok(())
    }

    pub fn resume_context(&self, vm_id: Uuid) -> HvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let context = inner
            .contexts
            .get_mut(&vm_id)
            .ok_or_else(|| HvError::not_found(format!("isolation context for {vm_id}")))?;
        if context.state != ContextState::Suspended {
            return Err(HvError::invalid_state("context is not suspended"));
        }
        context.state = ContextState::Active;
        Ok(())
    }

    pub fn has_capability(&self, vm_id: Uuid, cap: Capability) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .contexts
            .get(&vm_id)
            .is_some_and(|ctx| ctx.capabilities.contains(&cap))
    }

    pub fn has_namespace(&self, vm_id: Uuid, ns: Namespace) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .contexts
            .get(&vm_id)
            .is_some_and(|ctx| ctx.namespaces.contains(&ns))
    }

    /// Returns true when the VM holds `cap` and its context is
    /// active; otherwise records a [`CapabilityViolation`] in the
    /// bounded ring and notifies subscribers.
    pub fn enforce_capability(&self, vm_id: Uuid, cap: Capability, reason: &str) -> bool {
        let (held, active, level) = {
            let inner = self.inner.lock().unwrap();
            match inner.contexts.get(&vm_id) {
                Some(ctx) => (
                    ctx.capabilities.contains(&cap),
                    ctx.state == ContextState::Active,
                    ctx.isolation_level,
                ),
                None => (false, false, IsolationLevel::None),
            }
        };

        if held && active {
            return true;
        }

        let violation = CapabilityViolation {
            vm_id,
            capability: cap,
            reason: reason.to_string(),
            timestamp: Utc::now(),
            severity: violation_severity_for(level),
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.violations.push(violation.clone());
        }
        self.subscribers.emit(&violation);
        tracing::warn!(%vm_id, ?cap, "capability enforcement failed");

        false
    }

    pub fn context(&self, vm_id: Uuid) -> Option<IsolationContext> {
        self.inner.lock().unwrap().contexts.get(&vm_id).cloned()
    }

    pub fn recent_violations(&self) -> Vec<CapabilityViolation> {
        self.inner.lock().unwrap().violations.to_vec()
    }
}
