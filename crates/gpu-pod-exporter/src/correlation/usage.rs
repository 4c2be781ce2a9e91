use std::collections::HashSet;

use tracing::debug;
use tracing::warn;

use super::uuid_index::UuidIndex;
use crate::types::DeviceId;
use crate::types::UsageRecord;
use crate::types::WorkloadSnapshot;

/// Widest bitmap that fits the packed value.
const MAX_PACKED_DEVICES: usize = u128::BITS as usize;

/// Logical occupancy of every enumerated device, ordered by device index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageBitmap {
    pub records: Vec<UsageRecord>,
}

impl UsageBitmap {
    /// Bits joined with commas, most significant (device 0) first: `1,0,1`.
    pub fn bit_string(&self) -> String {
        self.records
            .iter()
            .map(|record| if record.allocated { "1" } else { "0" })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The bitmap read as an unsigned binary number, device 0 being the most
    /// significant bit: with N devices, device `i` contributes `2^(N-1-i)`.
    ///
    /// Only the first 128 devices fit; the rest are left out of the value.
    pub fn packed(&self) -> u128 {
        if self.records.len() > MAX_PACKED_DEVICES {
            warn!(
                devices = self.records.len(),
                "Too many devices for the packed usage value, truncating"
            );
        }
        self.records
            .iter()
            .take(MAX_PACKED_DEVICES)
            .fold(0u128, |acc, record| (acc << 1) | u128::from(record.allocated))
    }

    pub fn allocated_count(&self) -> usize {
        self.records.iter().filter(|record| record.allocated).count()
    }
}

/// Marks every enumerated device referenced anywhere in `snapshot` as
/// allocated, whatever resource name it was granted under.
pub fn build_usage(uuid_index: &UuidIndex, snapshot: &WorkloadSnapshot, hostname: &str) -> UsageBitmap {
    let referenced: HashSet<DeviceId> = snapshot
        .all_device_ids()
        .map(DeviceId::normalized)
        .collect();

    let records: Vec<UsageRecord> = uuid_index
        .devices()
        .into_iter()
        .map(|(device_index, device_id)| UsageRecord {
            hostname: hostname.to_string(),
            device_index,
            allocated: referenced.contains(&device_id),
            device_id,
        })
        .collect();

    let bitmap = UsageBitmap { records };
    debug!(
        devices = bitmap.records.len(),
        allocated = bitmap.allocated_count(),
        "Built device usage bitmap"
    );
    bitmap
}
