//! Audit Bridge (C8)
//!
//! The append-only store is an injected collaborator so the bridge
//! is testable without real durable storage; [`InMemoryAppendOnlyStore`]
//! is the ephemeral default, documented as such.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use hv_types::audit::{AuditEvent, Envelope, EventType, SOURCE_HYPERVISOR};
use hv_types::error::{HvError, HvResult};

/// Required operations for the pluggable audit log.
pub trait AppendOnlyStore: Send + Sync {
    fn append(&self, entry: Envelope) -> HvResult<usize>;
    fn length(&self) -> usize;
    fn get(&self, index: usize) -> HvResult<Envelope>;
}

/// Ephemeral, in-process implementation. Not durable: contents are
/// lost when the process exits.
#[derive(Default)]
pub struct InMemoryAppendOnlyStore {
    entries: Mutex<Vec<Envelope>>,
}

impl InMemoryAppendOnlyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AppendOnlyStore for InMemoryAppendOnlyStore {
    fn append(&self, entry: Envelope) -> HvResult<usize> {
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry);
        Ok(entries.len() - 1)
    }

    fn length(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn get(&self, index: usize) -> HvResult<Envelope> {
        self.entries
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .ok_or_else(|| HvError::not_found(format!("no entry at index {index}")))
    }
}

/// Maintains the attached-VM set and forwards validated events into
/// the append-only store as `{source, vm_id?, agent_id?, event}`
/// envelopes.
pub struct AuditBridge {
    store: Arc<dyn AppendOnlyStore>,
    attached: Mutex<HashSet<String>>,
}

impl AuditBridge {
    pub fn new(store: Arc<dyn AppendOnlyStore>) -> Self {
        Self {
            store,
            attached: Mutex::new(HashSet::new()),
        }
    }

    pub fn attach(&self, vm_id: impl Into<String>) {
        self.attached.lock().unwrap().insert(vm_id.into());
    }

    pub fn detach(&self, vm_id: &str) {
        self.attached.lock().unwrap().remove(vm_id);
    }

    pub fn is_attached(&self, vm_id: &str) -> bool {
        self.attached.lock().unwrap().contains(vm_id)
    }

    /// Drops events whose `vm_id` is set but not attached (events
    /// without a `vm_id` are always recorded). Returns `None` for a
    /// dropped event, `Some(index)` for an appended one.
    pub fn log_event(&self, event: AuditEvent) -> HvResult<Option<usize>> {
        if let Some(vm_id) = &event.vm_id
            && !self.is_attached(vm_id)
        {
            return Ok(None);
        }

        let envelope = Envelope {
            source: SOURCE_HYPERVISOR.to_string(),
            vm_id: event.vm_id.clone(),
            agent_id: event.agent_id.clone(),
            event,
        };
        self.store.append(envelope).map(Some)
    }

    pub fn read_all_events(&self) -> HvResult<Vec<AuditEvent>> {
        (0..self.store.length())
            .map(|i| self.store.get(i).map(|envelope| envelope.event))
            .collect()
    }

    pub fn read_vm_events(&self, vm_id: &str) -> HvResult<Vec<AuditEvent>> {
        Ok(self
            .read_all_events()?
            .into_iter()
            .filter(|event| event.vm_id.as_deref() == Some(vm_id))
            .collect())
    }

    pub fn read_events_by_type(&self, event_type: EventType) -> HvResult<Vec<AuditEvent>> {
        Ok(self
            .read_all_events()?
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hv_types::audit::Severity;
    use std::collections::HashMap;

    fn event(event_type: EventType, vm_id: Option<&str>) -> AuditEvent {
        AuditEvent {
            event_type,
            vm_id: vm_id.map(String::from),
            agent_id: None,
            details: HashMap::new(),
            timestamp: Utc::now(),
            severity: Severity::Info,
        }
    }

    #[test]
    fn events_without_vm_id_always_recorded() {
        let bridge = AuditBridge::new(Arc::new(InMemoryAppendOnlyStore::new()));
        let index = bridge.log_event(event(EventType::Error, None)).unwrap();
        assert_eq!(index, Some(0));
    }

    #[test]
    fn unattached_vm_events_are_dropped() {
        let bridge = AuditBridge::new(Arc::new(InMemoryAppendOnlyStore::new()));
        let index = bridge
            .log_event(event(EventType::VmSpawned, Some("vm-1")))
            .unwrap();
        assert_eq!(index, None);
        assert!(bridge.read_all_events().unwrap().is_empty());
    }

    #[test]
    fn attached_vm_events_are_recorded_in_order() {
        let bridge = AuditBridge::new(Arc::new(InMemoryAppendOnlyStore::new()));
        bridge.attach("vm-1");
        bridge
            .log_event(event(EventType::VmSpawned, Some("vm-1")))
            .unwrap();
        bridge
            .log_event(event(EventType::VmStateChange, Some("vm-1")))
            .unwrap();
        let events = bridge.read_all_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::VmSpawned);
        assert_eq!(events[1].event_type, EventType::VmStateChange);
    }

    #[test]
    fn read_vm_events_filters_by_vm() {
        let bridge = AuditBridge::new(Arc::new(InMemoryAppendOnlyStore::new()));
        bridge.attach("vm-1");
        bridge.attach("vm-2");
        bridge
            .log_event(event(EventType::VmSpawned, Some("vm-1")))
            .unwrap();
        bridge
            .log_event(event(EventType::VmSpawned, Some("vm-2")))
            .unwrap();
        let events = bridge.read_vm_events("vm-1").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn read_events_by_type_filters() {
        let bridge = AuditBridge::new(Arc::new(InMemoryAppendOnlyStore::new()));
        bridge.log_event(event(EventType::Error, None)).unwrap();
        bridge
            .log_event(event(EventType::HealthWarning, None))
            .unwrap();
        let errors = bridge.read_events_by_type(EventType::Error).unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn detach_stops_further_recording() {
        let bridge = AuditBridge::new(Arc::new(InMemoryAppendOnlyStore::new()));
        bridge.attach("vm-1");
        bridge
            .log_event(event(EventType::VmSpawned, Some("vm-1")))
            .unwrap();
        bridge.detach("vm-1");
        let index = bridge
            .log_event(event(EventType::VmTerminated, Some("vm-1")))
            .unwrap();
        assert_eq!(index, None);
        assert_eq!(bridge.read_all_events().unwrap().len(), 1);
    }
}
