//! Daemon wiring: the correlation worker, its triggers and the HTTP server.

pub mod exporter;
pub mod server;
pub mod tasks;

use std::path::PathBuf;
use std::sync::Arc;

use notify::RecommendedWatcher;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use exporter::CycleSummary;
pub use exporter::Exporter;

use crate::config::DaemonArgs;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Failed to watch {}", path.display())]
    Watch { path: PathBuf },
    #[error("HTTP server failed")]
    Server,
}

/// Running daemon. Dropping it without [`Application::shutdown`] leaves the
/// tasks detached.
pub struct Application {
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
    _watcher: Option<RecommendedWatcher>,
}

impl Application {
    /// Starts the HTTP server and, when an exporter is available, the
    /// correlation worker with its file watcher and poller. Without an
    /// exporter the server keeps serving whatever was published before.
    pub fn start(args: &DaemonArgs, exporter: Option<Exporter>) -> Self {
        let cancellation_token = CancellationToken::new();
        let mut handles = Vec::new();
        let mut watcher = None;

        if let Some(exporter) = exporter {
            let worker = Arc::new(tasks::CycleWorker::new(Arc::new(exporter)));
            let trigger = worker.trigger();

            match tasks::watch_source(&args.exporter.source_metrics_file, trigger.clone()) {
                Ok(w) => watcher = Some(w),
                Err(e) => warn!("Failed to set up source watcher, relying on polling: {e:?}"),
            }

            handles.push({
                let token = cancellation_token.clone();
                tokio::spawn(async move { worker.run(token).await })
            });
            handles.push(tokio::spawn(tasks::run_poller(
                trigger,
                args.poll_interval(),
                cancellation_token.clone(),
            )));
        }

        handles.push({
            let token = cancellation_token.clone();
            let listen_addr = args.listen_addr.clone();
            let output_dir = args.exporter.output_dir.clone();
            tokio::spawn(async move {
                if let Err(e) = server::serve(listen_addr, output_dir, token).await {
                    error!("HTTP server failed: {e:?}");
                }
            })
        });

        Self {
            tasks: handles,
            cancellation_token,
            _watcher: watcher,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Blocks until a shutdown signal arrives or the token is cancelled.
    pub async fn run(&self) -> std::io::Result<()> {
        tokio::select! {
            result = tasks::wait_for_shutdown_signal() => result,
            _ = self.cancellation_token.cancelled() => Ok(()),
        }
    }

    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Task ended abnormally: {e}");
            }
        }
        info!("All tasks stopped");
    }
}
