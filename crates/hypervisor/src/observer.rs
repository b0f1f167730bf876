//! Observer (C9)
//!
//! The observer holds no reference
//! back to the manager it watches: [`Observer::attach`] takes `&Arc<Self>`
//! and registers a closure over that clone with the manager's own
//! subscriber bus, so the only strong reference flows manager→closure,
//! never observer→manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hv_types::events::{Ring, SubscriptionHandle};
use hv_types::vm::Provider;

use crate::sandbox::{SandboxEvent, SandboxManager};

const RECENT_EVENTS_CAPACITY: usize = 500;
const INCIDENT_RING_CAPACITY: usize = 2000;

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub spawned: u64,
    pub terminated: u64,
    pub running: u64,
    pub errors: u64,
    pub tasks_executed: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SecurityCounters {
    pub policy_violations: u64,
    pub image_failures: u64,
    pub unauthorized_attempts: u64,
    pub sandbox_escape_attempts: u64,
}

pub struct Observer {
    counters: Mutex<Counters>,
    provider_histogram: Mutex<HashMap<Provider, u64>>,
    security: Mutex<SecurityCounters>,
    recent_events: Mutex<Ring<SandboxEvent>>,
    incidents: Mutex<Ring<Instant>>,
    health_warning_window_ms: u64,
    health_warning_threshold: u64,
    was_healthy: Mutex<bool>,
    events: hv_types::events::Subscribers<SandboxEvent>,
}

impl Observer {
    pub fn new(health_warning_window_ms: u64, health_warning_threshold: u64) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            provider_histogram: Mutex::new(HashMap::new()),
            security: Mutex::new(SecurityCounters::default()),
            recent_events: Mutex::new(Ring::new(RECENT_EVENTS_CAPACITY)),
            incidents: Mutex::new(Ring::new(INCIDENT_RING_CAPACITY)),
            health_warning_window_ms,
            health_warning_threshold,
            was_healthy: Mutex::new(true),
            events: hv_types::events::Subscribers::new(),
        }
    }

    /// Subscribe to the observer's own stream (raw pass-through plus
    /// synthesized `health-warning` events).
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&SandboxEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Register this observer against `manager`'s event stream.
    pub fn attach(self: &Arc<Self>, manager: &SandboxManager) -> SubscriptionHandle {
        let observer = self.clone();
        manager.subscribe(move |event| observer.handle_event(event))
    }

    fn handle_event(&self, event: &SandboxEvent) {
        self.recent_events.lock().unwrap().push(event.clone());

        match event {
            SandboxEvent::VmSpawned(instance) => {
                let mut counters = self.counters.lock().unwrap();
                counters.spawned += 1;
                counters.running += 1;
                drop(counters);
                *self
                    .provider_histogram
                    .lock()
                    .unwrap()
                    .entry(instance.spec.provider)
                    .or_insert(0) += 1;
            }
            SandboxEvent::VmTerminated { .. } => {
                let mut counters = self.counters.lock().unwrap();
                counters.terminated += 1;
                counters.running = counters.running.saturating_sub(1);
            }
            SandboxEvent::TaskExecuted { .. } => {
                self.counters.lock().unwrap().tasks_executed += 1;
            }
            SandboxEvent::Error { .. } => {
                self.counters.lock().unwrap().errors += 1;
                self.record_incident();
            }
            SandboxEvent::SecurityViolation { reason, .. } => {
                self.classify_violation(reason);
                self.record_incident();
            }
            SandboxEvent::PolicyEvaluated { decision, .. } => {
                if !decision.allowed {
                    self.security.lock().unwrap().policy_violations += 1;
                }
            }
            _ => {}
        }
    }

    fn classify_violation(&self, reason: &str) {
        let lower = reason.to_lowercase();
        let mut security = self.security.lock().unwrap();
        if lower.contains("image") {
            security.image_failures += 1;
        } else if lower.contains("unauthorized") {
            security.unauthorized_attempts += 1;
        } else if lower.contains("escape") {
            security.sandbox_escape_attempts += 1;
        }
    }

    fn record_incident(&self) {
        self.incidents.lock().unwrap().push(Instant::now());

        let healthy_now = self.compute_is_healthy();
        let mut was_healthy = self.was_healthy.lock().unwrap();
        if *was_healthy && !healthy_now {
            let error_count = self.counters.lock().unwrap().errors;
            self.events.emit(&SandboxEvent::HealthWarning {
                message: format!(
                    "error/security-violation rate crossed threshold {} within {}ms",
                    self.health_warning_threshold, self.health_warning_window_ms
                ),
                error_count,
            });
        }
        *was_healthy = healthy_now;
    }

    fn compute_is_healthy(&self) -> bool {
        let window = Duration::from_millis(self.health_warning_window_ms);
        let cutoff = Instant::now().checked_sub(window);
        let count = self
            .incidents
            .lock()
            .unwrap()
            .iter()
            .filter(|t| cutoff.is_none_or(|cutoff| **t >= cutoff))
            .count();
        (count as u64) < self.health_warning_threshold
    }

    pub fn is_healthy(&self) -> bool {
        self.compute_is_healthy()
    }

    pub fn counters(&self) -> Counters {
        *self.counters.lock().unwrap()
    }

    pub fn provider_histogram(&self) -> HashMap<Provider, u64> {
        self.provider_histogram.lock().unwrap().clone()
    }

    pub fn security_counters(&self) -> SecurityCounters {
        *self.security.lock().unwrap()
    }

    pub fn recent_events(&self) -> Vec<SandboxEvent> {
        self.recent_events.lock().unwrap().to_vec()
    }
}
