use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::Notify;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::exporter::Exporter;
use super::AppError;

/// Runs cycles one at a time. Triggers that arrive while a cycle is running
/// collapse into a single follow-up cycle.
pub struct CycleWorker {
    exporter: Arc<Exporter>,
    trigger: Arc<Notify>,
}

impl CycleWorker {
    pub fn new(exporter: Arc<Exporter>) -> Self {
        Self {
            exporter,
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting correlation worker");
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Correlation worker shutdown requested");
                    break;
                }
                _ = self.trigger.notified() => {
                    if let Err(e) = self.exporter.run_cycle().await {
                        error!("Correlation cycle failed: {e:?}");
                    }
                }
            }
        }
    }
}

/// Fires `trigger` every `period`, the first time immediately.
pub async fn run_poller(trigger: Arc<Notify>, period: Duration, cancellation_token: CancellationToken) {
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            _ = ticks.tick() => {
                debug!("Periodic correlation trigger");
                trigger.notify_one();
            }
        }
    }
}

/// Watches the directory of `source` and fires `trigger` whenever the file
/// itself changes. The directory is watched so that rename-based writers are
/// seen too. The returned watcher stops on drop.
pub fn watch_source(
    source: &Path,
    trigger: Arc<Notify>,
) -> Result<RecommendedWatcher, Report<AppError>> {
    let watch_failed = || AppError::Watch {
        path: source.to_path_buf(),
    };
    let dir = match source.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = source
        .file_name()
        .map(ToOwned::to_owned)
        .ok_or_else(|| Report::new(watch_failed()))
        .attach_printable("source metrics path has no file name")?;

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                if event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(file_name.as_os_str()))
                {
                    debug!("Source metrics changed: {:?}", event.kind);
                    trigger.notify_one();
                }
            }
            Err(e) => {
                error!("Filesystem watch error: {e:?}");
            }
        },
        Config::default(),
    )
    .change_context_lazy(watch_failed)?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .change_context_lazy(watch_failed)?;
    info!("Watching {} for source metric updates", dir.display());
    Ok(watcher)
}

/// Resolves on SIGTERM or SIGINT.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn coalesced_triggers_leave_one_pending_permit() {
        let trigger = Arc::new(Notify::new());
        trigger.notify_one();
        trigger.notify_one();
        trigger.notify_one();

        tokio::time::timeout(Duration::from_secs(1), trigger.notified())
            .await
            .expect("first trigger should be pending");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), trigger.notified())
                .await
                .is_err(),
            "repeated triggers must not queue more than one cycle"
        );
    }

    #[tokio::test]
    async fn poller_fires_immediately() {
        let trigger = Arc::new(Notify::new());
        let token = CancellationToken::new();
        let poller = tokio::spawn(run_poller(
            trigger.clone(),
            Duration::from_secs(3600),
            token.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(1), trigger.notified())
            .await
            .expect("poller should trigger on start");
        token.cancel();
        poller.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn watcher_fires_on_source_change() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("dcgm.prom");
        fs::write(&source, "a 1\n").unwrap();

        let trigger = Arc::new(Notify::new());
        let _watcher = watch_source(&source, trigger.clone()).unwrap();
        fs::write(&source, "a 2\n").unwrap();

        tokio::time::timeout(Duration::from_secs(5), trigger.notified())
            .await
            .expect("change to the source file should trigger a cycle");
    }

    #[test]
    fn watch_requires_a_file_name() {
        let trigger = Arc::new(Notify::new());
        assert!(watch_source(Path::new("/"), trigger).is_err());
    }
}
