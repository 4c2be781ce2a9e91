//! Host integrations: accelerator library, kubelet, container runtime and
//! the process table.

pub mod docker;
pub mod k8s;
pub mod nvml;
pub mod procfs;
