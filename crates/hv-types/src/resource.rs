//! Resource Snapshot, Threshold, and Alert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDimension {
    CpuMillicores,
    MemoryMb,
    DiskMb,
    NetworkRxKbps,
    NetworkTxKbps,
}

impl ResourceDimension {
    pub const ALL: [ResourceDimension; 5] = [
        ResourceDimension::CpuMillicores,
        ResourceDimension::MemoryMb,
        ResourceDimension::DiskMb,
        ResourceDimension::NetworkRxKbps,
        ResourceDimension::NetworkTxKbps,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub vm_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_millicores: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub network_rx_kbps: f64,
    pub network_tx_kbps: f64,
}

impl ResourceSnapshot {
    pub fn dimension(&self, dim: ResourceDimension) -> f64 {
        match dim {
            ResourceDimension::CpuMillicores => self.cpu_millicores,
            ResourceDimension::MemoryMb => self.memory_mb,
            ResourceDimension::DiskMb => self.disk_mb,
            ResourceDimension::NetworkRxKbps => self.network_rx_kbps,
            ResourceDimension::NetworkTxKbps => self.network_tx_kbps,
        }
    }
}

/// Any subset of snapshot dimensions with a positive limit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceThreshold {
    pub vm_id_set: bool,
    #[serde(default)]
    pub cpu_millicores: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<f64>,
    #[serde(default)]
    pub disk_mb: Option<f64>,
    #[serde(default)]
    pub network_rx_kbps: Option<f64>,
    #[serde(default)]
    pub network_tx_kbps: Option<f64>,
}

impl ResourceThreshold {
    pub fn limit(&self, dim: ResourceDimension) -> Option<f64> {
        match dim {
            ResourceDimension::CpuMillicores => self.cpu_millicores,
            ResourceDimension::MemoryMb => self.memory_mb,
            ResourceDimension::DiskMb => self.disk_mb,
            ResourceDimension::NetworkRxKbps => self.network_rx_kbps,
            ResourceDimension::NetworkTxKbps => self.network_tx_kbps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAlert {
    pub vm_id: String,
    pub resource: ResourceDimension,
    pub current_value: f64,
    pub threshold: f64,
    pub percent_used: f64,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
}

/// Warning at ratio >= 0.80, critical at ratio >= 0.95.
pub fn severity_for_ratio(ratio: f64) -> Option<AlertSeverity> {
    if ratio >= 0.95 {
        Some(AlertSeverity::Critical)
    } else if ratio >= 0.80 {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DimensionUsage {
    pub latest: f64,
    pub avg: f64,
    pub peak: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub cpu_millicores: DimensionUsage,
    pub memory_mb: DimensionUsage,
    pub disk_mb: DimensionUsage,
    pub network_rx_kbps: DimensionUsage,
    pub network_tx_kbps: DimensionUsage,
    pub snapshot_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_thresholds() {
        assert_eq!(severity_for_ratio(0.79), None);
        assert_eq!(severity_for_ratio(0.80), Some(AlertSeverity::Warning));
        assert_eq!(severity_for_ratio(0.94), Some(AlertSeverity::Warning));
        assert_eq!(severity_for_ratio(0.95), Some(AlertSeverity::Critical));
        assert_eq!(severity_for_ratio(1.2), Some(AlertSeverity::Critical));
    }
}
