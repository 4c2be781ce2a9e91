//! Container runtime access over the Docker Engine API unix socket.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use error_stack::Report;
use error_stack::ResultExt;
use http_body_util::BodyExt;
use http_body_util::Empty;
use hyper::header;
use hyper::Request;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

use crate::types::ContainerDescriptor;

#[derive(Debug, Error)]
pub enum ContainerRuntimeError {
    #[error("Failed to connect to container runtime at {}", path.display())]
    ConnectionFailed { path: PathBuf },
    #[error("Container runtime request {endpoint} failed")]
    RequestFailed { endpoint: String },
    #[error("Container runtime returned {status} for {endpoint}")]
    UnexpectedStatus { endpoint: String, status: u16 },
    #[error("Failed to decode container runtime response for {endpoint}")]
    InvalidResponse { endpoint: String },
}

/// A container as listed by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Container runtime lookups needed by the correlation engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Host pid of the container's init process, `None` when no running
    /// container matches.
    async fn init_pid(
        &self,
        descriptor: &ContainerDescriptor,
    ) -> Result<Option<u32>, Report<ContainerRuntimeError>>;

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, Report<ContainerRuntimeError>>;

    /// Name the runtime reports for the host, used as the `hostname` label.
    async fn host_identity(&self) -> Result<String, Report<ContainerRuntimeError>>;
}

/// Picks the container matching `descriptor`, preferring the kubelet labels
/// over the dockershim name.
pub fn find_container<'a>(
    containers: &'a [ContainerSummary],
    descriptor: &ContainerDescriptor,
) -> Option<&'a ContainerSummary> {
    containers
        .iter()
        .find(|container| descriptor.matches_labels(&container.labels))
        .or_else(|| {
            containers.iter().find(|container| {
                container
                    .names
                    .iter()
                    .any(|name| descriptor.matches_name(name))
            })
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    state: ContainerState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    #[serde(default)]
    pid: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SystemInfo {
    name: String,
}

/// [`ContainerRuntime`] speaking HTTP/1.1 to `dockerd`.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    socket_path: PathBuf,
}

impl DockerRuntime {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<T, Report<ContainerRuntimeError>> {
        let request_failed = || ContainerRuntimeError::RequestFailed {
            endpoint: endpoint.to_string(),
        };

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .change_context_lazy(|| ContainerRuntimeError::ConnectionFailed {
                path: self.socket_path.clone(),
            })?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .change_context_lazy(request_failed)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Container runtime connection closed with error");
            }
        });

        let request = Request::get(endpoint)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .change_context_lazy(request_failed)?;
        let response = sender
            .send_request(request)
            .await
            .change_context_lazy(request_failed)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Report::new(ContainerRuntimeError::UnexpectedStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            }));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .change_context_lazy(request_failed)?
            .to_bytes();
        serde_json::from_slice(&body).change_context_lazy(|| {
            ContainerRuntimeError::InvalidResponse {
                endpoint: endpoint.to_string(),
            }
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[tracing::instrument(level = "debug", skip(self), fields(container = %descriptor))]
    async fn init_pid(
        &self,
        descriptor: &ContainerDescriptor,
    ) -> Result<Option<u32>, Report<ContainerRuntimeError>> {
        let containers = self.list_containers().await?;
        let Some(container) = find_container(&containers, descriptor) else {
            debug!("No running container matches descriptor");
            return Ok(None);
        };

        let inspect: ContainerInspect = self
            .get(&format!("/containers/{}/json", container.id))
            .await?;
        // dockerd reports pid 0 for containers that are not running
        Ok(Some(inspect.state.pid).filter(|pid| *pid > 0))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, Report<ContainerRuntimeError>> {
        self.get("/containers/json").await
    }

    async fn host_identity(&self) -> Result<String, Report<ContainerRuntimeError>> {
        let info: SystemInfo = self.get("/info").await?;
        Ok(info.name)
    }
}
