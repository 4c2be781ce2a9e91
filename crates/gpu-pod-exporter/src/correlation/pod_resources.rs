use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::debug;
use tracing::warn;

use super::ancestry::AncestryResolver;
use super::uuid_index::UuidIndex;
use crate::platform::nvml::AcceleratorManager;
use crate::platform::procfs::ProcessTable;
use crate::types::ContainerDescriptor;
use crate::types::DeviceGrant;
use crate::types::DeviceId;
use crate::types::PodIdentity;
use crate::types::ProcessKey;
use crate::types::ProcessRecord;
use crate::types::WorkloadSnapshot;

pub type DeviceMap = BTreeMap<DeviceId, PodIdentity>;
pub type ProcessMap = BTreeMap<ProcessKey, ProcessRecord>;

/// Name used when neither the accelerator library nor procfs knows a process.
const UNKNOWN_PROCESS_NAME: &str = "unknown";

/// Physical device id → owner for every device granted under `resource_name`.
///
/// Virtual and sub-indexed ids are keyed by their physical id, which is what
/// the metric lines carry. A physical id granted to two containers in one
/// snapshot keeps the later grant.
pub fn build_device_map(snapshot: &WorkloadSnapshot, resource_name: &str) -> DeviceMap {
    let mut devices = DeviceMap::new();
    for grant in snapshot.grants(resource_name) {
        let device_id = grant.device_id.normalized();
        if let Some(previous) = devices.insert(device_id.clone(), grant.owner) {
            debug!(
                %device_id,
                granted_as = %grant.device_id,
                previous = %previous,
                "Device granted to more than one container, keeping the later grant"
            );
        }
    }
    devices
}

/// Derives the per-process attribution from a workload snapshot.
pub struct PodResourceIndex<'a> {
    pub(super) resource_name: &'a str,
    pub(super) uuid_index: &'a Arc<UuidIndex>,
    pub(super) accelerator: &'a Arc<dyn AcceleratorManager>,
    pub(super) ancestry: &'a Arc<AncestryResolver>,
    pub(super) processes: &'a Arc<dyn ProcessTable>,
}

impl PodResourceIndex<'_> {
    pub fn build_device_map(&self, snapshot: &WorkloadSnapshot) -> DeviceMap {
        build_device_map(snapshot, self.resource_name)
    }

    /// Every process running on a granted device that descends from the
    /// container the device was granted to.
    ///
    /// Devices are walked concurrently; the map is assembled once every walk
    /// has finished.
    pub async fn build_process_map(&self, snapshot: &WorkloadSnapshot) -> ProcessMap {
        let mut walks: FuturesUnordered<_> = snapshot
            .grants(self.resource_name)
            .map(|grant| self.attribute_device(grant))
            .collect();

        let mut processes = ProcessMap::new();
        while let Some(records) = walks.next().await {
            for record in records {
                processes.insert(record.key(), record);
            }
        }
        processes
    }

    /// Accelerator and procfs calls block, so they run on the blocking pool
    /// and only the runtime lookup stays on the async worker.
    #[tracing::instrument(level = "debug", skip_all, fields(device_id = %grant.device_id, owner = %grant.owner))]
    async fn attribute_device(&self, grant: DeviceGrant<'_>) -> Vec<ProcessRecord> {
        let device_id = grant.device_id.normalized();
        let uuid_index = self.uuid_index.clone();
        let accelerator = self.accelerator.clone();
        let lookup_id = device_id.clone();
        let lookup = tokio::task::spawn_blocking(move || {
            let device_index = uuid_index.resolve(&lookup_id)?;
            Some((device_index, accelerator.running_processes(device_index)))
        })
        .await;

        let (device_index, running) = match lookup {
            Ok(Some((device_index, Ok(running)))) => (device_index, running),
            Ok(Some((device_index, Err(e)))) => {
                warn!(device_index, error = ?e, "Failed to list processes on device");
                return Vec::new();
            }
            Ok(None) => {
                warn!(%device_id, "Granted device is not known to the accelerator library");
                return Vec::new();
            }
            Err(e) => {
                warn!(%device_id, "Device lookup task failed: {e}");
                return Vec::new();
            }
        };
        if running.is_empty() {
            return Vec::new();
        }

        let descriptor = ContainerDescriptor::from(&grant.owner);
        let Some(init_pid) = self.ancestry.init_pid(&descriptor).await else {
            return Vec::new();
        };

        let ancestry = self.ancestry.clone();
        let processes = self.processes.clone();
        let owner = grant.owner.clone();
        let records = tokio::task::spawn_blocking(move || {
            running
                .into_iter()
                .filter(|process| ancestry.descends_from(process.pid, init_pid))
                .map(|process| {
                    let process_name = process
                        .name
                        .or_else(|| processes.process_name(process.pid).ok())
                        .unwrap_or_else(|| UNKNOWN_PROCESS_NAME.to_string());
                    ProcessRecord {
                        owner: owner.clone(),
                        device_index,
                        device_id: device_id.clone(),
                        pid: process.pid,
                        process_name,
                        kind: process.kind,
                        used_memory_bytes: process.used_memory_bytes,
                    }
                })
                .collect::<Vec<_>>()
        })
        .await;

        records.unwrap_or_else(|e| {
            warn!(device_index, "Ancestry walk task failed: {e}");
            Vec::new()
        })
    }
}
