//! In-memory stand-ins for the host integrations. Built for unit tests and,
//! behind the `testing` feature, for integration tests.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;

use crate::platform::docker::ContainerRuntime;
use crate::platform::docker::ContainerRuntimeError;
use crate::platform::docker::ContainerSummary;
use crate::platform::k8s::PodResourcesError;
use crate::platform::k8s::PodResourcesSource;
use crate::platform::nvml::AcceleratorError;
use crate::platform::nvml::AcceleratorManager;
use crate::platform::procfs::ProcError;
use crate::platform::procfs::ProcessTable;
use crate::types::ContainerDescriptor;
use crate::types::ContainerDevices;
use crate::types::ContainerResources;
use crate::types::DeviceId;
use crate::types::GpuProcess;
use crate::types::PodResources;
use crate::types::WorkloadSnapshot;

/// Builds a snapshot with one pod per `(pod, namespace, container, resource, ids)`.
pub fn snapshot<'a>(
    pods: impl IntoIterator<Item = (&'a str, &'a str, &'a str, &'a str, &'a [&'a str])>,
) -> WorkloadSnapshot {
    let pods = pods
        .into_iter()
        .map(|(name, namespace, container, resource_name, ids)| PodResources {
            name: name.to_string(),
            namespace: namespace.to_string(),
            containers: vec![ContainerResources {
                name: container.to_string(),
                devices: vec![ContainerDevices {
                    resource_name: resource_name.to_string(),
                    device_ids: ids.iter().map(|id| DeviceId::from(*id)).collect(),
                }],
            }],
        })
        .collect();
    WorkloadSnapshot { pods }
}

#[derive(Debug, Default)]
pub struct FakeAccelerator {
    devices: Mutex<Vec<DeviceId>>,
    processes: HashMap<u32, Vec<GpuProcess>>,
    failing_processes: HashSet<u32>,
    fail_device_count: AtomicBool,
    enumeration_stall: Option<Duration>,
    enumerations: AtomicUsize,
}

impl FakeAccelerator {
    pub fn with_devices<I, D>(devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        Self {
            devices: Mutex::new(devices.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn with_processes(mut self, index: u32, processes: Vec<GpuProcess>) -> Self {
        self.processes.insert(index, processes);
        self
    }

    pub fn failing_processes_on(mut self, index: u32) -> Self {
        self.failing_processes.insert(index);
        self
    }

    /// Replaces the device list, as after a hot-plug or driver reload.
    pub fn set_devices<I, D>(&self, devices: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        *self.devices.lock().expect("poisoned") = devices.into_iter().map(Into::into).collect();
    }

    /// Makes every `device_count` call block the calling thread for `stall`,
    /// like a driver that stops responding.
    pub fn with_enumeration_stall(mut self, stall: Duration) -> Self {
        self.enumeration_stall = Some(stall);
        self
    }

    pub fn fail_device_count(&self, fail: bool) {
        self.fail_device_count.store(fail, Ordering::SeqCst);
    }

    /// Number of `device_count` calls, i.e. index rebuilds.
    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

impl AcceleratorManager for FakeAccelerator {
    fn device_count(&self) -> Result<u32, Report<AcceleratorError>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        if let Some(stall) = self.enumeration_stall {
            std::thread::sleep(stall);
        }
        if self.fail_device_count.load(Ordering::SeqCst) {
            return Err(Report::new(AcceleratorError::DeviceCount));
        }
        Ok(self.devices.lock().expect("poisoned").len() as u32)
    }

    fn device_at(&self, index: u32) -> Result<DeviceId, Report<AcceleratorError>> {
        self.devices
            .lock()
            .expect("poisoned")
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Report::new(AcceleratorError::Device { index }))
    }

    fn running_processes(&self, index: u32) -> Result<Vec<GpuProcess>, Report<AcceleratorError>> {
        if self.failing_processes.contains(&index) {
            return Err(Report::new(AcceleratorError::Processes { index }));
        }
        Ok(self.processes.get(&index).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct FakeProcessTable {
    parents: HashMap<u32, u32>,
    names: HashMap<u32, String>,
}

impl FakeProcessTable {
    /// `(child, parent)` edges; pids without an entry behave as exited.
    pub fn with_parents(edges: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            parents: edges.into_iter().collect(),
            names: HashMap::new(),
        }
    }

    pub fn with_name(mut self, pid: u32, name: &str) -> Self {
        self.names.insert(pid, name.to_string());
        self
    }
}

impl ProcessTable for FakeProcessTable {
    fn parent_pid(&self, pid: u32) -> Result<u32, ProcError> {
        self.parents
            .get(&pid)
            .copied()
            .ok_or_else(|| ProcError::ProcReadError {
                message: format!("no process {pid}"),
            })
    }

    fn process_name(&self, pid: u32) -> Result<String, ProcError> {
        self.names
            .get(&pid)
            .cloned()
            .ok_or_else(|| ProcError::ProcReadError {
                message: format!("no process {pid}"),
            })
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainerRuntime {
    init_pids: HashMap<ContainerDescriptor, u32>,
    hostname: String,
    failing: bool,
}

impl Default for FakeContainerRuntime {
    fn default() -> Self {
        Self {
            init_pids: HashMap::new(),
            hostname: "fake-node".to_string(),
            failing: false,
        }
    }
}

impl FakeContainerRuntime {
    pub fn with_init_pid(mut self, descriptor: ContainerDescriptor, pid: u32) -> Self {
        self.init_pids.insert(descriptor, pid);
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    /// Every call fails as if the runtime socket were unreachable.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    fn check(&self) -> Result<(), Report<ContainerRuntimeError>> {
        if self.failing {
            Err(Report::new(ContainerRuntimeError::RequestFailed {
                endpoint: "/fake".to_string(),
            }))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn init_pid(
        &self,
        descriptor: &ContainerDescriptor,
    ) -> Result<Option<u32>, Report<ContainerRuntimeError>> {
        self.check()?;
        Ok(self.init_pids.get(descriptor).copied())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, Report<ContainerRuntimeError>> {
        self.check()?;
        Ok(self
            .init_pids
            .keys()
            .map(|descriptor| ContainerSummary {
                id: descriptor.dockershim_name(),
                names: vec![format!("/{}_0", descriptor.dockershim_name())],
                labels: HashMap::new(),
            })
            .collect())
    }

    async fn host_identity(&self) -> Result<String, Report<ContainerRuntimeError>> {
        self.check()?;
        Ok(self.hostname.clone())
    }
}

#[derive(Debug, Default)]
pub struct FakePodResources {
    snapshot: Mutex<WorkloadSnapshot>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakePodResources {
    pub fn new(snapshot: WorkloadSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            ..Default::default()
        }
    }

    pub fn set_snapshot(&self, snapshot: WorkloadSnapshot) {
        *self.snapshot.lock().expect("poisoned") = snapshot;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodResourcesSource for FakePodResources {
    async fn list_pod_resources(&self) -> Result<WorkloadSnapshot, Report<PodResourcesError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Report::new(PodResourcesError::ListFailed));
        }
        Ok(self.snapshot.lock().expect("poisoned").clone())
    }
}
