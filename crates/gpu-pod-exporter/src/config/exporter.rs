use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use clap::Parser;

use crate::correlation::DEFAULT_ANCESTRY_FLOOR_PID;

/// Settings shared by every subcommand that runs correlation cycles.
#[derive(Args, Debug, Clone)]
pub struct ExporterArgs {
    #[arg(
        long,
        env = "DCGM_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/run/prometheus/dcgm.prom",
        help = "Text exposition file written by the GPU metrics exporter"
    )]
    pub source_metrics_file: PathBuf,

    #[arg(
        long,
        env = "POD_METRICS_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/run/prometheus",
        help = "Directory receiving dcgm-pod.prom, dcgm-process.prom and dcgm-usage.prom"
    )]
    pub output_dir: PathBuf,

    #[arg(
        long,
        help = "Kubelet socket path for listing pod resources",
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock",
        value_hint = clap::ValueHint::FilePath,
    )]
    pub kubelet_socket_path: PathBuf,

    #[arg(
        long,
        help = "Docker Engine API socket path",
        default_value = "/var/run/docker.sock",
        value_hint = clap::ValueHint::FilePath,
    )]
    pub docker_socket_path: PathBuf,

    #[arg(
        long,
        help = "Extended resource name of the accelerators",
        default_value = "nvidia.com/gpu"
    )]
    pub resource_name: String,

    #[arg(
        long,
        help = "Label carrying the device id in the source metrics",
        default_value = "uuid"
    )]
    pub id_label: String,

    #[arg(
        long,
        help = "Pid at or below which the process ancestry walk gives up",
        default_value_t = DEFAULT_ANCESTRY_FLOOR_PID
    )]
    pub ancestry_floor_pid: u32,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Host name used in usage metrics, defaults to the name reported by the container runtime"
    )]
    pub node_name: Option<String>,

    #[arg(
        long,
        help = "Upper bound on a single correlation cycle in seconds",
        default_value_t = 30
    )]
    pub cycle_timeout_secs: u64,
}

impl ExporterArgs {
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub exporter: ExporterArgs,

    #[arg(
        long,
        env = "LISTEN_ADDR",
        default_value = "0.0.0.0:9400",
        help = "HTTP listen address serving the published metrics"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        help = "Seconds between cycles when the source file does not change",
        default_value_t = 10
    )]
    pub poll_interval_secs: u64,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,
}

impl DaemonArgs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
