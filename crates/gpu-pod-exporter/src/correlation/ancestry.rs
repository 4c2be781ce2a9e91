use std::sync::Arc;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::platform::docker::ContainerRuntime;
use crate::platform::procfs::ProcessTable;
use crate::types::ContainerDescriptor;

/// Pid at or below which the parent walk stops without a match.
pub const DEFAULT_ANCESTRY_FLOOR_PID: u32 = 1;

/// Decides whether a process belongs to a container by walking its parent
/// chain up to the container's init process.
///
/// A floor that is too low lets the walk run up to the host init and costs a
/// few extra reads. A floor above a container's init pid produces false
/// negatives, so raise it only on hosts where container init pids are known to
/// be large.
pub struct AncestryResolver {
    runtime: Arc<dyn ContainerRuntime>,
    processes: Arc<dyn ProcessTable>,
    floor_pid: u32,
}

impl AncestryResolver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        processes: Arc<dyn ProcessTable>,
        floor_pid: u32,
    ) -> Self {
        Self {
            runtime,
            processes,
            floor_pid,
        }
    }

    pub fn floor_pid(&self) -> u32 {
        self.floor_pid
    }

    /// Host pid of the container's init process. Runtime failures are
    /// reported as `None`.
    pub async fn init_pid(&self, descriptor: &ContainerDescriptor) -> Option<u32> {
        match self.runtime.init_pid(descriptor).await {
            Ok(Some(pid)) => Some(pid),
            Ok(None) => {
                debug!(container = %descriptor, "Container init process not found");
                None
            }
            Err(e) => {
                warn!(container = %descriptor, error = ?e, "Failed to resolve container init pid");
                None
            }
        }
    }

    pub async fn belongs_to_container(&self, pid: u32, descriptor: &ContainerDescriptor) -> bool {
        match self.init_pid(descriptor).await {
            Some(init_pid) => self.descends_from(pid, init_pid),
            None => false,
        }
    }

    /// Walks the parent chain of `pid` looking for `init_pid`.
    ///
    /// `pid` itself counts as part of its chain, so a container whose
    /// entrypoint is the GPU process matches.
    pub fn descends_from(&self, pid: u32, init_pid: u32) -> bool {
        if pid == init_pid {
            return true;
        }

        let mut current = pid;
        loop {
            let parent = match self.processes.parent_pid(current) {
                Ok(parent) => parent,
                Err(e) => {
                    warn!(pid, at = current, error = %e, "Failed to resolve parent process");
                    return false;
                }
            };

            if parent == init_pid {
                trace!(pid, init_pid, "Process descends from container init");
                return true;
            }
            if parent <= self.floor_pid {
                debug!(pid, init_pid, "Process does not descend from container init");
                return false;
            }
            current = parent;
        }
    }
}
