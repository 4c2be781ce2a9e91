//! Correlation of accelerator devices and processes with pod identity.
//!
//! - [`UuidIndex`]: device id → enumeration index cache
//! - [`AncestryResolver`]: container membership of a process
//! - [`PodResourceIndex`]: device and process maps from a workload snapshot
//! - [`build_usage`]: logical occupancy bitmap

pub mod ancestry;
pub mod pod_resources;
pub mod usage;
pub mod uuid_index;

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

pub use ancestry::AncestryResolver;
pub use ancestry::DEFAULT_ANCESTRY_FLOOR_PID;
pub use pod_resources::build_device_map;
pub use pod_resources::DeviceMap;
pub use pod_resources::PodResourceIndex;
pub use pod_resources::ProcessMap;
pub use usage::build_usage;
pub use usage::UsageBitmap;
pub use uuid_index::UuidIndex;

use crate::platform::docker::ContainerRuntime;
use crate::platform::nvml::AcceleratorManager;
use crate::platform::procfs::ProcessTable;
use crate::types::WorkloadSnapshot;

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("Failed to fetch the workload snapshot")]
    Snapshot,
    #[error("Failed to publish metrics")]
    Publish,
    #[error("Correlation cycle exceeded {seconds}s")]
    TimedOut { seconds: u64 },
}

/// Everything derived from one workload snapshot.
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub devices: DeviceMap,
    pub processes: ProcessMap,
    pub usage: UsageBitmap,
}

/// Owns the collaborators and the device index shared across cycles.
pub struct CorrelationEngine {
    accelerator: Arc<dyn AcceleratorManager>,
    processes: Arc<dyn ProcessTable>,
    uuid_index: Arc<UuidIndex>,
    ancestry: Arc<AncestryResolver>,
    resource_name: String,
}

impl CorrelationEngine {
    pub fn new(
        accelerator: Arc<dyn AcceleratorManager>,
        runtime: Arc<dyn ContainerRuntime>,
        processes: Arc<dyn ProcessTable>,
        resource_name: impl Into<String>,
        ancestry_floor_pid: u32,
    ) -> Self {
        Self {
            uuid_index: Arc::new(UuidIndex::new(accelerator.clone())),
            ancestry: Arc::new(AncestryResolver::new(
                runtime,
                processes.clone(),
                ancestry_floor_pid,
            )),
            accelerator,
            processes,
            resource_name: resource_name.into(),
        }
    }

    pub fn uuid_index(&self) -> &UuidIndex {
        &self.uuid_index
    }

    pub fn ancestry(&self) -> &AncestryResolver {
        &self.ancestry
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn pod_resource_index(&self) -> PodResourceIndex<'_> {
        PodResourceIndex {
            resource_name: &self.resource_name,
            uuid_index: &self.uuid_index,
            accelerator: &self.accelerator,
            ancestry: &self.ancestry,
            processes: &self.processes,
        }
    }

    /// Builds every correlation map for one cycle.
    ///
    /// Enumeration and `/proc` reads run on the blocking pool, so a caller's
    /// timeout can abandon a cycle stuck in the accelerator library.
    #[tracing::instrument(level = "debug", skip_all, fields(pods = snapshot.pods.len()))]
    pub async fn correlate(&self, snapshot: &WorkloadSnapshot, hostname: &str) -> Correlation {
        let index = self.pod_resource_index();
        let devices = index.build_device_map(snapshot);
        let processes = index.build_process_map(snapshot).await;
        let usage = self.usage(snapshot, hostname).await;

        tracing::debug!(
            devices = devices.len(),
            processes = processes.len(),
            allocated = usage.allocated_count(),
            "Correlation complete"
        );
        Correlation {
            devices,
            processes,
            usage,
        }
    }

    async fn usage(&self, snapshot: &WorkloadSnapshot, hostname: &str) -> UsageBitmap {
        let uuid_index = self.uuid_index.clone();
        let snapshot = snapshot.clone();
        let hostname = hostname.to_string();
        tokio::task::spawn_blocking(move || build_usage(&uuid_index, &snapshot, &hostname))
            .await
            .unwrap_or_else(|e| {
                warn!("Usage bitmap task failed: {e}");
                UsageBitmap::default()
            })
    }
}
