use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::exporter::DaemonArgs;
use crate::config::exporter::ExporterArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the source metrics and keep the pod-labelled files up to date
    Daemon(Box<DaemonArgs>),
    /// Run a single correlation cycle and exit
    Once(Box<ExporterArgs>),
}
