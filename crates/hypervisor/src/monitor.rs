//! Resource Monitor (C6)
//!
//! [`read_cgroup_snapshot`] mirrors `utils::CpuStats::from_str`'s
//! line-oriented `key value` stat parsing to build a
//! [`ResourceSnapshot`] from the live cgroup the isolation manager
//! created for a VM.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use hv_types::error::{HvError, HvResult};
use hv_types::events::{Ring, Subscribers};
use hv_types::resource::{
    AlertSeverity, DimensionUsage, ResourceAlert, ResourceDimension, ResourceSnapshot,
    ResourceThreshold, Usage, severity_for_ratio,
};

const DEFAULT_MAX_SNAPSHOTS_PER_VM: usize = 1000;
const ALERT_LOG_CAPACITY: usize = 1000;

struct VmHistory {
    snapshots: Ring<ResourceSnapshot>,
    threshold: ResourceThreshold,
}

pub struct ResourceMonitor {
    inner: Mutex<HashMap<String, VmHistory>>,
    subscribers: Subscribers<ResourceAlert>,
    alerts: Mutex<Ring<ResourceAlert>>,
    max_snapshots_per_vm: usize,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SNAPSHOTS_PER_VM)
    }
}

impl ResourceMonitor {
    pub fn new(max_snapshots_per_vm: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            subscribers: Subscribers::new(),
            alerts: Mutex::new(Ring::new(ALERT_LOG_CAPACITY)),
            max_snapshots_per_vm,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> hv_types::events::SubscriptionHandle
    where
        F: Fn(&ResourceAlert) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(listener)
    }

    pub fn set_threshold(&self, vm_id: &str, threshold: ResourceThreshold) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(vm_id.to_string()).or_insert_with(|| VmHistory {
            snapshots: Ring::new(self.max_snapshots_per_vm),
            threshold: ResourceThreshold::default(),
        });
        entry.threshold = threshold;
    }

    /// Append to the bounded per-VM ring and synchronously evaluate
    /// thresholds.
    pub fn record_snapshot(&self, snapshot: ResourceSnapshot) {
        let mut alerts_to_emit = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .entry(snapshot.vm_id.clone())
                .or_insert_with(|| VmHistory {
                    snapshots: Ring::new(self.max_snapshots_per_vm),
                    threshold: ResourceThreshold::default(),
                });

            for dim in ResourceDimension::ALL {
                if let Some(limit) = entry.threshold.limit(dim)
                    && limit > 0.0
                {
                    let current = snapshot.dimension(dim);
                    let ratio = current / limit;
                    if let Some(severity) = severity_for_ratio(ratio) {
                        alerts_to_emit.push(ResourceAlert {
                            vm_id: snapshot.vm_id.clone(),
                            resource: dim,
                            current_value: current,
                            threshold: limit,
                            percent_used: ratio * 100.0,
                            timestamp: snapshot.timestamp,
                            severity,
                        });
                    }
                }
            }

            entry.snapshots.push(snapshot);
        }

        let mut log = self.alerts.lock().unwrap();
        for alert in &alerts_to_emit {
            log.push(alert.clone());
        }
        drop(log);

        for alert in &alerts_to_emit {
            if alert.severity == AlertSeverity::Critical {
                tracing::error!(vm_id = %alert.vm_id, resource = ?alert.resource, "resource critical");
            } else {
                tracing::warn!(vm_id = %alert.vm_id, resource = ?alert.resource, "resource warning");
            }
            self.subscribers.emit(alert);
        }
    }

    pub fn get_usage(&self, vm_id: &str) -> HvResult<Usage> {
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .get(vm_id)
            .ok_or_else(|| HvError::not_found(format!("no snapshots for {vm_id}")))?;

        let samples = entry.snapshots.to_vec();
        let count = samples.len();
        if count == 0 {
            return Ok(Usage::default());
        }

        let mut usage = Usage {
            snapshot_count: count,
            ..Default::default()
        };

        for dim in ResourceDimension::ALL {
            let values: Vec<f64> = samples.iter().map(|s| s.dimension(dim)).collect();
            let latest = *values.last().unwrap();
            let avg = values.iter().sum::<f64>() / count as f64;
            let peak = values.iter().cloned().fold(f64::MIN, f64::max);
            let du = DimensionUsage { latest, avg, peak };
            match dim {
                ResourceDimension::CpuMillicores => usage.cpu_millicores = du,
                ResourceDimension::MemoryMb => usage.memory_mb = du,
                ResourceDimension::DiskMb => usage.disk_mb = du,
                ResourceDimension::NetworkRxKbps => usage.network_rx_kbps = du,
                ResourceDimension::NetworkTxKbps => usage.network_tx_kbps = du,
            }
        }

        Ok(usage)
    }

    pub fn remove_vm(&self, vm_id: &str) {
        self.inner.lock().unwrap().remove(vm_id);
    }

    pub fn recent_alerts(&self) -> Vec<ResourceAlert> {
        self.alerts.lock().unwrap().to_vec()
    }
}

/// `key value` pairs as found in a cgroup v2 `cpu.stat` file.
#[derive(Debug)]
struct CgroupCpuStat {
    usage_usec: u64,
}

impl FromStr for CgroupCpuStat {
    type Err = CgroupStatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut stats = HashMap::new();
        for line in s.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 2 {
                return Err(CgroupStatError::InvalidRow(line.to_string()));
            }
            let value = parts[1]
                .parse::<u64>()
                .map_err(|_| CgroupStatError::InvalidNumber(parts[1].to_string()))?;
            stats.insert(parts[0], value);
        }
        let usage_usec = *stats
            .get("usage_usec")
            .ok_or(CgroupStatError::MissingField("usage_usec"))?;
        Ok(Self { usage_usec })
    }
}

#[derive(Debug, thiserror::Error)]
enum CgroupStatError {
    #[error("invalid row: \"{0}\"")]
    InvalidRow(String),
    #[error("invalid number: \"{0}\"")]
    InvalidNumber(String),
    #[error("missing field: \"{0}\"")]
    MissingField(&'static str),
}

/// Build a [`ResourceSnapshot`] by reading `cpu.stat` and
/// `memory.current` under a VM's cgroup path (best-effort; production
/// callers fall back to provider-reported telemetry on error).
pub fn read_cgroup_snapshot(vm_id: &str, cgroup_path: &str) -> HvResult<ResourceSnapshot> {
    let cpu_stat_text =
        std::fs::read_to_string(format!("{cgroup_path}/cpu.stat")).map_err(HvError::Io)?;
    let cpu_stat = CgroupCpuStat::from_str(&cpu_stat_text)
        .map_err(|e| HvError::validation(format!("malformed cpu.stat: {e}")))?;

    let memory_bytes = std::fs::read_to_string(format!("{cgroup_path}/memory.current"))
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);

    Ok(ResourceSnapshot {
        vm_id: vm_id.to_string(),
        timestamp: Utc::now(),
        cpu_millicores: cpu_stat.usage_usec as f64 / 1000.0,
        memory_mb: memory_bytes as f64 / (1024.0 * 1024.0),
        disk_mb: 0.0,
        network_rx_kbps: 0.0,
        network_tx_kbps: 0.0,
    })
}
