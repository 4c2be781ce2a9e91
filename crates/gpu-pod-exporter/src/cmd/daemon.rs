use anyhow::Context;
use anyhow::Result;
use utils::logging;
use utils::version;

use crate::app::Application;
use crate::app::Exporter;
use crate::config::DaemonArgs;

pub async fn run_daemon(args: DaemonArgs) -> Result<()> {
    let _guard = match &args.log_file {
        Some(path) => Some(
            logging::init_with_file(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?,
        ),
        None => {
            logging::init();
            None
        }
    };

    tracing::info!("Starting gpu-pod-exporter daemon {}", &**version::VERSION);

    std::fs::create_dir_all(&args.exporter.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            args.exporter.output_dir.display()
        )
    })?;

    let exporter = match Exporter::from_args(&args.exporter) {
        Ok(exporter) => Some(exporter),
        Err(e) => {
            tracing::error!(
                "Accelerator library unavailable, serving previously published metrics only: {e:?}"
            );
            None
        }
    };

    let app = Application::start(&args, exporter);
    app.run().await.context("Failed to install signal handlers")?;
    app.shutdown().await;

    Ok(())
}
