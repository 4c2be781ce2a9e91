use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;
use tracing::warn;

use crate::config::ExporterArgs;
use crate::correlation::CorrelationEngine;
use crate::correlation::CorrelationError;
use crate::metrics::rewriter::MetricsRewriter;
use crate::metrics::MetricFamily;
use crate::platform::docker::ContainerRuntime;
use crate::platform::docker::DockerRuntime;
use crate::platform::k8s::KubeletPodResources;
use crate::platform::k8s::PodResourcesSource;
use crate::platform::nvml::init_nvml;
use crate::platform::nvml::AcceleratorError;
use crate::platform::nvml::AcceleratorManager;
use crate::platform::nvml::NvmlAccelerator;
use crate::platform::procfs::ProcFs;
use crate::platform::procfs::ProcessTable;

/// `hostname` label value when neither a node name nor the runtime is available.
const UNKNOWN_HOST: &str = "unknown";

/// Counts reported for one finished cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub pods: usize,
    pub devices: usize,
    pub processes: usize,
    pub allocated: usize,
    /// Families whose publish failed; their previous files are still in place.
    pub failed: Vec<MetricFamily>,
}

/// Runs correlation cycles: snapshot, correlate, publish.
pub struct Exporter {
    pod_resources: Arc<dyn PodResourcesSource>,
    runtime: Arc<dyn ContainerRuntime>,
    engine: CorrelationEngine,
    rewriter: MetricsRewriter,
    source_metrics_file: PathBuf,
    node_name: Option<String>,
    cycle_timeout: Duration,
}

impl Exporter {
    pub fn new(
        args: &ExporterArgs,
        accelerator: Arc<dyn AcceleratorManager>,
        pod_resources: Arc<dyn PodResourcesSource>,
        runtime: Arc<dyn ContainerRuntime>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            engine: CorrelationEngine::new(
                accelerator,
                runtime.clone(),
                processes,
                args.resource_name.clone(),
                args.ancestry_floor_pid,
            ),
            rewriter: MetricsRewriter::new(&args.output_dir, args.id_label.clone()),
            pod_resources,
            runtime,
            source_metrics_file: args.source_metrics_file.clone(),
            node_name: args.node_name.clone(),
            cycle_timeout: args.cycle_timeout(),
        }
    }

    /// Wires the host collaborators: NVML, the kubelet socket, the Docker
    /// socket and `/proc`.
    ///
    /// # Errors
    ///
    /// - [`AcceleratorError::InitFailed`] if NVML cannot be loaded
    pub fn from_args(args: &ExporterArgs) -> Result<Self, Report<AcceleratorError>> {
        let nvml = init_nvml()?;
        Ok(Self::new(
            args,
            Arc::new(NvmlAccelerator::new(Arc::new(nvml))),
            Arc::new(KubeletPodResources::new(&args.kubelet_socket_path)),
            Arc::new(DockerRuntime::new(&args.docker_socket_path)),
            Arc::new(ProcFs::default()),
        ))
    }

    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }

    pub fn rewriter(&self) -> &MetricsRewriter {
        &self.rewriter
    }

    /// Value of the `hostname` label on usage metrics.
    pub async fn hostname(&self) -> String {
        if let Some(node_name) = &self.node_name {
            return node_name.clone();
        }
        match self.runtime.host_identity().await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = ?e, "Failed to get host name from container runtime");
                UNKNOWN_HOST.to_string()
            }
        }
    }

    /// Runs one cycle bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// - [`CorrelationError::Snapshot`] if the workload snapshot is unavailable;
    ///   nothing is published in that case
    /// - [`CorrelationError::TimedOut`] if the cycle did not finish in time
    /// - [`CorrelationError::Publish`] if the publishing task died
    pub async fn run_cycle(&self) -> Result<CycleSummary, Report<CorrelationError>> {
        let seconds = self.cycle_timeout.as_secs();
        tokio::time::timeout(self.cycle_timeout, self.cycle())
            .await
            .map_err(|_| Report::new(CorrelationError::TimedOut { seconds }))?
    }

    async fn cycle(&self) -> Result<CycleSummary, Report<CorrelationError>> {
        let snapshot = self
            .pod_resources
            .list_pod_resources()
            .await
            .change_context(CorrelationError::Snapshot)?;
        let hostname = self.hostname().await;
        let correlation = self.engine.correlate(&snapshot, &hostname).await;

        let mut summary = CycleSummary {
            pods: snapshot.pods.len(),
            devices: correlation.devices.len(),
            processes: correlation.processes.len(),
            allocated: correlation.usage.allocated_count(),
            failed: Vec::new(),
        };

        let rewriter = self.rewriter.clone();
        let source = self.source_metrics_file.clone();
        let results =
            tokio::task::spawn_blocking(move || rewriter.rewrite(&source, &correlation, &hostname))
                .await
                .change_context(CorrelationError::Publish)?;
        summary.failed = results
            .into_iter()
            .filter_map(|(family, result)| result.is_err().then_some(family))
            .collect();

        info!(
            pods = summary.pods,
            devices = summary.devices,
            processes = summary.processes,
            allocated = summary.allocated,
            failed = summary.failed.len(),
            "Correlation cycle finished"
        );
        Ok(summary)
    }
}
