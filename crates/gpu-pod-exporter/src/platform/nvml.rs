//! NVIDIA Management Library (NVML) integration
//!
//! Device enumeration and per-device process listing behind the
//! [`AcceleratorManager`] trait so the correlation engine can be exercised
//! without a GPU.

use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::struct_wrappers::device::ProcessInfo;
use nvml_wrapper::Nvml;
use thiserror::Error;

use crate::types::DeviceId;
use crate::types::GpuProcess;
use crate::types::ProcessKind;

/// Longest process name requested from NVML.
const PROCESS_NAME_MAX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum AcceleratorError {
    #[error("Failed to initialize accelerator library")]
    InitFailed,
    #[error("Failed to count devices")]
    DeviceCount,
    #[error("Failed to query device {index}")]
    Device { index: u32 },
    #[error("Failed to list running processes on device {index}")]
    Processes { index: u32 },
}

/// Read access to the accelerator-management library.
pub trait AcceleratorManager: Send + Sync {
    fn device_count(&self) -> Result<u32, Report<AcceleratorError>>;

    /// Physical identifier of the device at enumeration index `index`.
    fn device_at(&self, index: u32) -> Result<DeviceId, Report<AcceleratorError>>;

    /// Compute and graphics processes currently resident on device `index`.
    fn running_processes(&self, index: u32) -> Result<Vec<GpuProcess>, Report<AcceleratorError>>;
}

pub struct NvmlAccelerator {
    nvml: Arc<Nvml>,
}

// NVML handles are thread-safe; the library serializes access internally.
unsafe impl Send for NvmlAccelerator {}
unsafe impl Sync for NvmlAccelerator {}

impl NvmlAccelerator {
    pub fn new(nvml: Arc<Nvml>) -> Self {
        Self { nvml }
    }

    fn to_gpu_process(&self, info: ProcessInfo, kind: ProcessKind) -> GpuProcess {
        let used_memory_bytes = match info.used_gpu_memory {
            UsedGpuMemory::Used(bytes) => bytes,
            UsedGpuMemory::Unavailable => 0,
        };
        GpuProcess {
            pid: info.pid,
            name: self
                .nvml
                .sys_process_name(info.pid, PROCESS_NAME_MAX_LEN)
                .ok(),
            kind,
            used_memory_bytes,
        }
    }
}

impl AcceleratorManager for NvmlAccelerator {
    fn device_count(&self) -> Result<u32, Report<AcceleratorError>> {
        self.nvml
            .device_count()
            .change_context(AcceleratorError::DeviceCount)
    }

    fn device_at(&self, index: u32) -> Result<DeviceId, Report<AcceleratorError>> {
        let device = self
            .nvml
            .device_by_index(index)
            .change_context(AcceleratorError::Device { index })?;
        let uuid = device
            .uuid()
            .change_context(AcceleratorError::Device { index })?;
        Ok(DeviceId::new(uuid))
    }

    fn running_processes(&self, index: u32) -> Result<Vec<GpuProcess>, Report<AcceleratorError>> {
        let device = self
            .nvml
            .device_by_index(index)
            .change_context(AcceleratorError::Device { index })?;

        let compute = device
            .running_compute_processes()
            .change_context(AcceleratorError::Processes { index })?;
        let graphics = match device.running_graphics_processes() {
            Ok(graphics) => graphics,
            Err(e) => {
                tracing::debug!(index, error = %e, "Graphics process listing unavailable");
                Vec::new()
            }
        };

        Ok(compute
            .into_iter()
            .map(|info| self.to_gpu_process(info, ProcessKind::Compute))
            .chain(
                graphics
                    .into_iter()
                    .map(|info| self.to_gpu_process(info, ProcessKind::Graphics)),
            )
            .collect())
    }
}

/// Initialize NVML, retrying with the explicit soname used inside containers.
pub fn init_nvml() -> Result<Nvml, Report<AcceleratorError>> {
    match Nvml::init() {
        Ok(nvml) => {
            tracing::info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            tracing::warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()
                .change_context(AcceleratorError::InitFailed)
                .attach_printable(
                    "is the NVIDIA driver installed and the nvidia container runtime configured?",
                )?;
            tracing::info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}
