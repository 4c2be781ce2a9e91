//! Client for the kubelet pod-resources gRPC API.
//!
//! Only the `List` call is used. Message types mirror
//! `k8s.io/kubelet/pkg/apis/podresources/{v1,v1alpha1}` and carry just the
//! fields the exporter reads; prost skips the rest on decode.

use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::debug;
use tracing::warn;

use crate::types::ContainerDevices;
use crate::types::ContainerResources;
use crate::types::DeviceId;
use crate::types::PodResources;
use crate::types::WorkloadSnapshot;

const LIST_V1: &str = "/v1.PodResourcesLister/List";
const LIST_V1ALPHA1: &str = "/v1alpha1.PodResourcesLister/List";

pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ListPodResourcesRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ListPodResourcesResponse {
        #[prost(message, repeated, tag = "1")]
        pub pod_resources: ::prost::alloc::vec::Vec<PodResources>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PodResources {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub namespace: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "3")]
        pub containers: ::prost::alloc::vec::Vec<ContainerResources>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ContainerResources {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "2")]
        pub devices: ::prost::alloc::vec::Vec<ContainerDevices>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ContainerDevices {
        #[prost(string, tag = "1")]
        pub resource_name: ::prost::alloc::string::String,
        #[prost(string, repeated, tag = "2")]
        pub device_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }
}

impl From<proto::ListPodResourcesResponse> for WorkloadSnapshot {
    fn from(response: proto::ListPodResourcesResponse) -> Self {
        let pods = response
            .pod_resources
            .into_iter()
            .map(|pod| PodResources {
                name: pod.name,
                namespace: pod.namespace,
                containers: pod
                    .containers
                    .into_iter()
                    .map(|container| ContainerResources {
                        name: container.name,
                        devices: container
                            .devices
                            .into_iter()
                            .map(|devices| ContainerDevices {
                                resource_name: devices.resource_name,
                                device_ids: devices
                                    .device_ids
                                    .into_iter()
                                    .map(DeviceId::from)
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        WorkloadSnapshot { pods }
    }
}

#[derive(Debug, Error)]
pub enum PodResourcesError {
    #[error("Failed to connect to kubelet pod-resources socket {}", path.display())]
    ConnectionFailed { path: PathBuf },
    #[error("Failed to list pod resources")]
    ListFailed,
}

/// Source of workload-resource snapshots.
#[async_trait]
pub trait PodResourcesSource: Send + Sync {
    async fn list_pod_resources(&self) -> Result<WorkloadSnapshot, Report<PodResourcesError>>;
}

/// [`PodResourcesSource`] backed by the kubelet unix socket.
#[derive(Debug, Clone)]
pub struct KubeletPodResources {
    socket_path: PathBuf,
}

impl KubeletPodResources {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Create a gRPC channel connected to the kubelet unix socket
    async fn create_unix_channel(&self) -> Result<Channel, Report<PodResourcesError>> {
        let socket_path = self.socket_path.clone();

        // The URI is a placeholder, the connector always dials the socket.
        Endpoint::try_from("http://[::]:50051")
            .change_context_lazy(|| PodResourcesError::ConnectionFailed {
                path: self.socket_path.clone(),
            })?
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move {
                    tokio::net::UnixStream::connect(socket_path)
                        .await
                        .map(TokioIo::new)
                }
            }))
            .await
            .change_context_lazy(|| PodResourcesError::ConnectionFailed {
                path: self.socket_path.clone(),
            })
    }

    async fn list(
        channel: Channel,
        path: &'static str,
    ) -> Result<proto::ListPodResourcesResponse, tonic::Status> {
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("Service was not ready: {e}")))?;
        let codec = tonic::codec::ProstCodec::<
            proto::ListPodResourcesRequest,
            proto::ListPodResourcesResponse,
        >::default();
        let response = grpc
            .unary(
                tonic::Request::new(proto::ListPodResourcesRequest {}),
                PathAndQuery::from_static(path),
                codec,
            )
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl PodResourcesSource for KubeletPodResources {
    #[tracing::instrument(skip(self), fields(socket = %self.socket_path.display()))]
    async fn list_pod_resources(&self) -> Result<WorkloadSnapshot, Report<PodResourcesError>> {
        let channel = self.create_unix_channel().await?;

        let response = match Self::list(channel.clone(), LIST_V1).await {
            Ok(response) => response,
            Err(status) if status.code() == tonic::Code::Unimplemented => {
                warn!("kubelet does not serve pod-resources v1, falling back to v1alpha1");
                Self::list(channel, LIST_V1ALPHA1)
                    .await
                    .change_context(PodResourcesError::ListFailed)?
            }
            Err(status) => {
                return Err(Report::new(status).change_context(PodResourcesError::ListFailed))
            }
        };

        debug!(
            pods = response.pod_resources.len(),
            "Listed pod resources from kubelet"
        );
        Ok(response.into())
    }
}
