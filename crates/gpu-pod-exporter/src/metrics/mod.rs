//! Text exposition artifacts.
//!
//! Each metric family is published as its own file in the output directory.
//! Temp files share the directory so the final rename stays atomic.

pub mod exposition;
pub mod rewriter;

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

pub use rewriter::RewriteError;

/// Label names added to correlated samples.
pub const POD_NAME: &str = "pod_name";
pub const POD_NAMESPACE: &str = "pod_namespace";
pub const CONTAINER_NAME: &str = "container_name";
pub const PROCESS_PID: &str = "process_pid";

/// Label that identifies a device in the source metrics.
pub const DEFAULT_ID_LABEL: &str = "uuid";
/// Label carrying the pid on per-process source samples.
pub const DEFAULT_PID_LABEL: &str = "pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricFamily {
    /// Device metrics re-labelled with the owning container.
    Device,
    /// Per-process memory on devices granted to containers.
    Process,
    /// Logical device allocation.
    Usage,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 3] = [Self::Device, Self::Process, Self::Usage];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Device => "dcgm-pod.prom",
            Self::Process => "dcgm-process.prom",
            Self::Usage => "dcgm-usage.prom",
        }
    }

    /// Prefix of the temp files; disjoint per family so concurrent publishes
    /// never collide.
    pub fn temp_prefix(self) -> &'static str {
        match self {
            Self::Device => ".dcgm-pod",
            Self::Process => ".dcgm-process",
            Self::Usage => ".dcgm-usage",
        }
    }

    pub fn destination(self, output_dir: &Path) -> PathBuf {
        output_dir.join(self.file_name())
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => f.write_str("device"),
            Self::Process => f.write_str("process"),
            Self::Usage => f.write_str("usage"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn families_have_disjoint_files_and_prefixes() {
        let files: HashSet<_> = MetricFamily::ALL.iter().map(|f| f.file_name()).collect();
        let prefixes: HashSet<_> = MetricFamily::ALL.iter().map(|f| f.temp_prefix()).collect();
        assert_eq!(files.len(), 3);
        assert_eq!(prefixes.len(), 3);
        for family in MetricFamily::ALL {
            assert!(!family.file_name().starts_with(family.temp_prefix()));
        }
        assert_eq!(
            MetricFamily::Usage.destination(Path::new("/run/prometheus")),
            PathBuf::from("/run/prometheus/dcgm-usage.prom")
        );
    }
}
