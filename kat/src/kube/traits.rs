use crate::error::KubeResult;
use async_trait::async_trait;
use common::PodPhase;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Phase observed for one pod by a watch subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEvent {
    pub name: String,
    pub phase: PodPhase,
}

/// Long-lived watch subscription. Ends when the server closes it.
pub type PhaseEventStream = BoxStream<'static, KubeResult<PhaseEvent>>;

/// Channels requested when attaching to a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    pub container: String,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

impl AttachOptions {
    /// Interactive attach to `container`.
    ///
    /// With a TTY the remote merges stderr into stdout, so stderr is not requested.
    pub fn interactive(container: &str, tty: bool) -> Self {
        Self {
            container: container.to_string(),
            stdin: true,
            stdout: true,
            stderr: !tty,
            tty,
        }
    }
}

/// Negotiated attach stream. Channels that were not requested are `None`.
pub struct AttachedStreams {
    pub stdin: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    pub stdout: Option<Pin<Box<dyn AsyncRead + Send>>>,
    pub stderr: Option<Pin<Box<dyn AsyncRead + Send>>>,
    /// Resolves once the underlying transport has shut down
    pub completion: BoxFuture<'static, KubeResult<()>>,
}

/// Abstraction for pod operations to enable testing with mocks
#[async_trait]
pub trait PodOperations: Send + Sync {
    /// Create a pod in a namespace, returning the object stored by the server
    async fn create_pod(&self, namespace: &str, pod: Pod) -> KubeResult<Pod>;

    /// Subscribe to phase changes of pods matching a label selector.
    /// The current state of matching pods is delivered first.
    async fn watch_pods(&self, namespace: &str, label_selector: &str)
        -> KubeResult<PhaseEventStream>;

    /// Open an attach stream into a running container's stdio
    async fn attach(
        &self,
        namespace: &str,
        name: &str,
        options: &AttachOptions,
    ) -> KubeResult<AttachedStreams>;

    /// Delete a pod. A missing pod is reported as `KubeError::NotFound`.
    async fn delete_pod(&self, namespace: &str, name: &str) -> KubeResult<()>;
}
