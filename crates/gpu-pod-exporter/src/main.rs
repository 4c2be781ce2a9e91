use anyhow::Result;
use clap::Parser;
use gpu_pod_exporter::cmd;
use gpu_pod_exporter::config::Cli;
use gpu_pod_exporter::config::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => cmd::run_daemon(*daemon_args).await,
        Commands::Once(exporter_args) => cmd::run_once(*exporter_args).await,
    }
}
