//! Maps devices to their cluster profile.

use super::config::{AggregationConfig, ClusterProfile, DeviceCluster};

/// Resolves devices against `device_clusters` in list order.
///
/// An entry naming the device wins; otherwise the first catch-all entry
/// (empty device list) applies. Devices matching neither have no cluster.
pub struct ClusterResolver<'a> {
    clusters: &'a [DeviceCluster],
    config: &'a AggregationConfig,
}

impl<'a> ClusterResolver<'a> {
    pub fn new(config: &'a AggregationConfig) -> Self {
        Self {
            clusters: &config.device_clusters,
            config,
        }
    }

    pub fn resolve(&self, device_id: &str) -> Option<&'a ClusterProfile> {
        let entry = self
            .clusters
            .iter()
            .find(|c| c.devices.iter().any(|d| d == device_id))
            .or_else(|| self.clusters.iter().find(|c| c.is_catch_all()))?;
        self.config.profile(&entry.cluster)
    }

    pub fn has_catch_all(&self) -> bool {
        self.clusters.iter().any(DeviceCluster::is_catch_all)
    }

    /// Devices named explicitly, in configuration order, without repeats.
    pub fn explicit_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = Vec::new();
        for device in self.clusters.iter().flat_map(|c| &c.devices) {
            if !devices.contains(device) {
                devices.push(device.clone());
            }
        }
        devices
    }
}
