use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::platform::nvml::AcceleratorError;
use crate::platform::nvml::AcceleratorManager;
use crate::types::DeviceId;

#[derive(Debug, Default)]
struct IndexTable {
    by_id: HashMap<DeviceId, u32>,
    ordered: Vec<(u32, DeviceId)>,
}

/// Cache of physical device id → enumeration index.
///
/// Populated from the accelerator library on first use and repopulated on
/// every lookup miss. Rebuilds replace the whole table under the write lock,
/// so readers never observe a partially built index.
pub struct UuidIndex {
    accelerator: Arc<dyn AcceleratorManager>,
    table: RwLock<IndexTable>,
}

impl UuidIndex {
    pub fn new(accelerator: Arc<dyn AcceleratorManager>) -> Self {
        Self {
            accelerator,
            table: RwLock::new(IndexTable::default()),
        }
    }

    /// Enumeration index of `device_id`, rebuilding the table once on a miss.
    ///
    /// `device_id` is expected to be normalized already.
    pub fn resolve(&self, device_id: &DeviceId) -> Option<u32> {
        if let Some(index) = self.lookup(device_id) {
            return Some(index);
        }

        debug!(%device_id, "Device id not indexed, rebuilding");
        if let Err(e) = self.rebuild() {
            warn!(error = ?e, "Failed to rebuild device index");
            return None;
        }
        self.lookup(device_id)
    }

    fn lookup(&self, device_id: &DeviceId) -> Option<u32> {
        self.table
            .read()
            .expect("poisoned")
            .by_id
            .get(device_id)
            .copied()
    }

    /// Enumerates all devices and replaces the table. Returns the number of
    /// devices indexed.
    pub fn rebuild(&self) -> Result<usize, Report<AcceleratorError>> {
        let mut table = self.table.write().expect("poisoned");

        let count = match self.accelerator.device_count() {
            Ok(count) => count,
            Err(e) => {
                *table = IndexTable::default();
                return Err(e);
            }
        };

        let mut rebuilt = IndexTable::default();
        for index in 0..count {
            match self.accelerator.device_at(index) {
                Ok(device_id) => {
                    rebuilt.by_id.insert(device_id.clone(), index);
                    rebuilt.ordered.push((index, device_id));
                }
                Err(e) => warn!(index, error = ?e, "Skipping device that failed to enumerate"),
            }
        }

        info!(devices = rebuilt.ordered.len(), "Device index rebuilt");
        let indexed = rebuilt.ordered.len();
        *table = rebuilt;
        Ok(indexed)
    }

    /// Drops every cached entry; the next lookup rebuilds.
    pub fn invalidate(&self) {
        *self.table.write().expect("poisoned") = IndexTable::default();
    }

    /// All indexed devices ordered by enumeration index, building the table
    /// first when it is empty.
    pub fn devices(&self) -> Vec<(u32, DeviceId)> {
        if self.is_empty() {
            if let Err(e) = self.rebuild() {
                warn!(error = ?e, "Failed to build device index");
            }
        }
        self.table.read().expect("poisoned").ordered.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().expect("poisoned").ordered.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.read().expect("poisoned").ordered.len()
    }
}
