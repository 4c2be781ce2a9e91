//! Domain types shared by the correlation engine and the rewriter.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Characters that introduce a single-digit virtual sub-index (`GPU-abc_1`).
const SUB_INDEX_SEPARATORS: [char; 2] = ['_', ':'];

/// Suffix used by time-sliced replicas (`GPU-abc::3`).
const REPLICA_SEPARATOR: &str = "::";

/// Vendor-assigned identifier of an accelerator, e.g. `GPU-8f9c...`.
///
/// Identifiers handed out by sharing device plugins may carry a virtual
/// sub-index suffix. [`DeviceId::normalized`] strips it so the result can be
/// looked up against the physical devices reported by NVML.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the physical identifier. Idempotent.
    pub fn normalized(&self) -> DeviceId {
        let mut id = match self.0.split_once(REPLICA_SEPARATOR) {
            Some((physical, _)) => physical,
            None => self.0.as_str(),
        };
        while let Some(stripped) = strip_sub_index(id) {
            id = stripped;
        }
        DeviceId(id.to_string())
    }
}

fn strip_sub_index(id: &str) -> Option<&str> {
    let mut tail = id.char_indices().rev();
    let (_, last) = tail.next()?;
    let (separator_at, separator) = tail.next()?;
    if last.is_ascii_alphanumeric() && SUB_INDEX_SEPARATORS.contains(&separator) && separator_at > 0
    {
        Some(&id[..separator_at])
    } else {
        None
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Workload that was granted a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
    pub container_name: String,
}

impl PodIdentity {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            container_name: container_name.into(),
        }
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.container_name)
    }
}

/// Docker label carrying the pod name of a kubelet-managed container.
pub const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
/// Docker label carrying the pod namespace of a kubelet-managed container.
pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
/// Docker label carrying the container name of a kubelet-managed container.
pub const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";

/// How a container is looked up in the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerDescriptor {
    pub pod_name: String,
    pub namespace: String,
    pub container_name: String,
}

impl ContainerDescriptor {
    /// Name prefix the kubelet dockershim gives to containers:
    /// `k8s_<container>_<pod>_<namespace>_<pod uid>_<attempt>`.
    pub fn dockershim_name(&self) -> String {
        format!(
            "k8s_{}_{}_{}",
            self.container_name, self.pod_name, self.namespace
        )
    }

    pub fn matches_labels(&self, labels: &HashMap<String, String>) -> bool {
        labels.get(POD_NAME_LABEL) == Some(&self.pod_name)
            && labels.get(POD_NAMESPACE_LABEL) == Some(&self.namespace)
            && labels.get(CONTAINER_NAME_LABEL) == Some(&self.container_name)
    }

    /// Docker reports names with a leading `/`; substring matching ignores it.
    pub fn matches_name(&self, name: &str) -> bool {
        name.contains(&format!("{}_", self.dockershim_name()))
            || name.trim_start_matches('/') == self.dockershim_name()
    }
}

impl From<&PodIdentity> for ContainerDescriptor {
    fn from(pod: &PodIdentity) -> Self {
        Self {
            pod_name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            container_name: pod.container_name.clone(),
        }
    }
}

impl fmt::Display for ContainerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dockershim_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Compute,
    Graphics,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Compute => f.write_str("compute"),
            ProcessKind::Graphics => f.write_str("graphics"),
        }
    }
}

/// A process resident on a device, as reported by the accelerator library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: u32,
    pub name: Option<String>,
    pub kind: ProcessKind,
    pub used_memory_bytes: u64,
}

/// Composite key of the process map.
///
/// A pid may show up on several devices within one cycle, so the device is
/// part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessKey {
    pub device_index: u32,
    pub device_id: DeviceId,
    pub pid: u32,
}

impl ProcessKey {
    pub fn new(device_index: u32, device_id: impl Into<DeviceId>, pid: u32) -> Self {
        Self {
            device_index,
            device_id: device_id.into(),
            pid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub owner: PodIdentity,
    pub device_index: u32,
    pub device_id: DeviceId,
    pub pid: u32,
    pub process_name: String,
    pub kind: ProcessKind,
    pub used_memory_bytes: u64,
}

impl ProcessRecord {
    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(self.device_index, self.device_id.clone(), self.pid)
    }
}

/// Allocation state of one enumerated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub hostname: String,
    pub device_index: u32,
    pub device_id: DeviceId,
    pub allocated: bool,
}

/// Point-in-time view of which containers were granted which devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    pub pods: Vec<PodResources>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodResources {
    pub name: String,
    pub namespace: String,
    pub containers: Vec<ContainerResources>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResources {
    pub name: String,
    pub devices: Vec<ContainerDevices>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDevices {
    pub resource_name: String,
    pub device_ids: Vec<DeviceId>,
}

/// One granted device id together with the container it was granted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGrant<'a> {
    pub device_id: &'a DeviceId,
    pub owner: PodIdentity,
}

impl WorkloadSnapshot {
    /// Device grants for `resource_name`, in snapshot order.
    pub fn grants<'a>(&'a self, resource_name: &'a str) -> impl Iterator<Item = DeviceGrant<'a>> {
        self.pods.iter().flat_map(move |pod| {
            pod.containers.iter().flat_map(move |container| {
                container
                    .devices
                    .iter()
                    .filter(move |devices| devices.resource_name == resource_name)
                    .flat_map(move |devices| {
                        devices.device_ids.iter().map(move |device_id| DeviceGrant {
                            device_id,
                            owner: PodIdentity::new(&pod.name, &pod.namespace, &container.name),
                        })
                    })
            })
        })
    }

    /// Every device id in the snapshot, whatever resource it was granted under.
    pub fn all_device_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.pods
            .iter()
            .flat_map(|pod| pod.containers.iter())
            .flat_map(|container| container.devices.iter())
            .flat_map(|devices| devices.device_ids.iter())
    }
}
