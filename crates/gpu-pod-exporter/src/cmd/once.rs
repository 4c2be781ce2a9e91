use anyhow::Context;
use anyhow::Result;
use utils::logging;
use utils::version;

use crate::app::Exporter;
use crate::config::ExporterArgs;

pub async fn run_once(args: ExporterArgs) -> Result<()> {
    logging::init();

    tracing::info!("Running a single correlation cycle {}", &**version::VERSION);

    std::fs::create_dir_all(&args.output_dir).with_context(|| {
        format!("Failed to create output directory {}", args.output_dir.display())
    })?;

    let exporter = Exporter::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Failed to initialize accelerator library: {e:?}"))?;
    let summary = exporter
        .run_cycle()
        .await
        .map_err(|e| anyhow::anyhow!("Correlation cycle failed: {e:?}"))?;

    if !summary.failed.is_empty() {
        let failed: Vec<String> = summary.failed.iter().map(ToString::to_string).collect();
        anyhow::bail!("Failed to publish metric families: {}", failed.join(", "));
    }
    Ok(())
}
