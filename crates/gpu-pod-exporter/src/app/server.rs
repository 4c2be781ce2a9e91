use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use poem::get;
use poem::handler;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::AppError;
use crate::metrics::MetricFamily;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Directory the published families are read from.
#[derive(Debug, Clone)]
struct PublishedMetrics {
    output_dir: PathBuf,
}

/// Concatenation of every published family file that exists.
#[handler]
async fn gpu_metrics(Data(published): Data<&PublishedMetrics>) -> Response {
    let mut body = Vec::new();
    for family in MetricFamily::ALL {
        let path = family.destination(&published.output_dir);
        match tokio::fs::read(&path).await {
            Ok(content) => {
                body.extend_from_slice(&content);
                if !content.is_empty() && !content.ends_with(b"\n") {
                    body.push(b'\n');
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(%family, "Failed to read {}: {e}", path.display()),
        }
    }
    Response::builder()
        .content_type(EXPOSITION_CONTENT_TYPE)
        .body(body)
}

#[handler]
fn healthz() -> &'static str {
    "ok"
}

pub fn routes(output_dir: PathBuf) -> impl Endpoint {
    Route::new()
        .at("/gpu/metrics", get(gpu_metrics))
        .at("/healthz", get(healthz))
        .data(PublishedMetrics { output_dir })
        .with(Tracing)
}

/// Serves the published metrics until `cancellation_token` is cancelled.
///
/// # Errors
///
/// - [`AppError::Server`] if the listener cannot bind or the server fails
pub async fn serve(
    listen_addr: String,
    output_dir: PathBuf,
    cancellation_token: CancellationToken,
) -> Result<(), Report<AppError>> {
    info!("Starting HTTP metrics server on {listen_addr}");
    Server::new(TcpListener::bind(listen_addr))
        .run_with_graceful_shutdown(
            routes(output_dir),
            async move { cancellation_token.cancelled().await },
            Some(Duration::from_secs(5)),
        )
        .await
        .change_context(AppError::Server)?;
    info!("HTTP metrics server stopped");
    Ok(())
}
