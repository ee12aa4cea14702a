use crate::config::SessionConfig;
use crate::error::{
    AttachError, ConfigError, KubeError, StartError, StopError, WaitError, WatchError,
};
use crate::kube::client::KubeClient;
use crate::kube::traits::{AttachOptions, PodOperations};
use crate::pod::{build_pod, PodIdentity, CONTAINER_NAME};
use crate::stdio::{pump, PumpError};
use crate::watch::{PhaseWatch, Reopen};
use common::{PodPhase, PullPolicy};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    /// No pod yet
    Created,
    /// Pod exists but `start` failed after creating it
    Provisioned(PodIdentity),
    /// `start` succeeded
    Running(PodIdentity),
}

/// Lifecycle of one ephemeral pod: `start`, optionally `attach` and `wait`,
/// then `stop`.
///
/// Only `start` needs exclusive access. `attach`, `wait` and `stop` borrow
/// the session shared and may run at the same time. Nothing is cleaned up on
/// drop; the owner must call `stop`, also after a failed `start`.
pub struct Session<T: PodOperations + ?Sized> {
    pod_ops: Arc<T>,
    config: SessionConfig,
    state: SessionState,
    attached: AtomicBool,
    cancel: CancellationToken,
}

impl Session<KubeClient> {
    /// Session against the cluster described by `client_config`.
    ///
    /// Only builds the client; nothing is sent to the cluster.
    pub fn new(client_config: kube::Config, image: impl Into<String>) -> Result<Self, ConfigError> {
        let client = KubeClient::from_config(client_config)
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        Self::with_client(Arc::new(client), image)
    }
}

impl<T: PodOperations + ?Sized> Session<T> {
    pub fn with_client(pod_ops: Arc<T>, image: impl Into<String>) -> Result<Self, ConfigError> {
        let config = SessionConfig::new(image);
        if config.image.is_empty() {
            return Err(ConfigError::EmptyImage);
        }

        Ok(Self {
            pod_ops,
            config,
            state: SessionState::Created,
            attached: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn pull_policy(mut self, pull_policy: PullPolicy) -> Self {
        self.config.pull_policy = pull_policy;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.config
            .env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Attach with a TTY. The remote then merges stderr into stdout.
    pub fn tty(mut self, tty: bool) -> Self {
        self.config.tty = tty;
        self
    }

    /// Token that aborts blocked `start`, `attach` and `wait` calls
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The pod this session created, if any
    pub fn pod(&self) -> Option<&PodIdentity> {
        match &self.state {
            SessionState::Created => None,
            SessionState::Provisioned(pod) | SessionState::Running(pod) => Some(pod),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Running(_))
    }

    fn running_pod(&self) -> Option<&PodIdentity> {
        match &self.state {
            SessionState::Running(pod) => Some(pod),
            _ => None,
        }
    }

    /// Create the pod and block until it is running or has already succeeded
    pub async fn start(&mut self) -> Result<(), StartError> {
        if self.state != SessionState::Created {
            return Err(StartError::AlreadyStarted);
        }
        self.config.validate()?;

        let pod = PodIdentity::generate(&self.config.namespace);
        let name = pod.name.clone();

        tracing::info!(
            "Creating pod {} in namespace {} with image {}",
            name,
            pod.namespace,
            self.config.image
        );
        self.pod_ops
            .create_pod(&pod.namespace, build_pod(&pod, &self.config))
            .await
            .map_err(|source| {
                tracing::warn!("Pod {} was rejected: {}", name, source);
                StartError::CreateRejected {
                    name: name.clone(),
                    source,
                }
            })?;
        self.state = SessionState::Provisioned(pod.clone());

        let watch = PhaseWatch::new(Arc::clone(&self.pod_ops), pod.clone());
        let outcome = watch
            .until(&self.cancel, Reopen::Never, |phase| match phase {
                PodPhase::Pending => None,
                PodPhase::Running | PodPhase::Succeeded => Some(Ok(phase)),
                PodPhase::Failed => Some(Err(StartError::PodFailed { name: name.clone() })),
                PodPhase::Unknown => Some(Err(StartError::ConnectionLost { name: name.clone() })),
            })
            .await
            .map_err(|e| match e {
                WatchError::Open(source) | WatchError::Stream(source) => StartError::Watch {
                    name: name.clone(),
                    source,
                },
                WatchError::Closed => StartError::WatchClosed { name: name.clone() },
                WatchError::Cancelled => StartError::Cancelled { name: name.clone() },
            })
            .and_then(|decided| decided);

        match outcome {
            Ok(phase) => {
                tracing::info!("Pod {} is {}", name, phase);
                self.state = SessionState::Running(pod);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Pod {} did not start: {}", name, e);
                Err(e)
            }
        }
    }

    /// Pipe `stdin` into the pod's process and its output into `stdout` and
    /// `stderr`, blocking until the remote output closes.
    ///
    /// Allowed once per session, even if that one attempt fails.
    pub async fn attach<R, W, E>(&self, stdin: R, stdout: W, stderr: E) -> Result<(), AttachError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let pod = self.running_pod().ok_or(AttachError::NotStarted)?;
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(AttachError::AlreadyAttached);
        }

        let options = AttachOptions::interactive(CONTAINER_NAME, self.config.tty);
        tracing::info!("Attaching to pod {} (tty: {})", pod.name, options.tty);

        let negotiated = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AttachError::Cancelled),
            negotiated = self.pod_ops.attach(&pod.namespace, &pod.name, &options) => negotiated,
        };
        let streams = negotiated.map_err(|source| match source {
            KubeError::Connection(_) | KubeError::Stream(_) => AttachError::TransportFailed {
                name: pod.name.clone(),
                source,
            },
            KubeError::Api { .. }
            | KubeError::NotFound { .. }
            | KubeError::InvalidRequest(_)
            | KubeError::Upgrade(_) => AttachError::NegotiationFailed {
                name: pod.name.clone(),
                source,
            },
        })?;

        let result = pump(streams, stdin, stdout, stderr, &self.cancel)
            .await
            .map_err(|e| match e {
                PumpError::Attach(e) => e,
                PumpError::Transport(source) => AttachError::TransportFailed {
                    name: pod.name.clone(),
                    source,
                },
            });

        match &result {
            Ok(()) => tracing::info!("Detached from pod {}", pod.name),
            Err(e) => tracing::warn!("Attach to pod {} ended: {}", pod.name, e),
        }
        result
    }

    /// Stop the session by deleting its pod.
    ///
    /// Borrows the session shared, so it can run while `attach` or `wait` is
    /// still in flight. Those end the way the cluster ends them.
    pub async fn stop(&self) -> Result<(), StopError> {
        let pod = self.pod().ok_or(StopError::NotStarted)?;

        tracing::info!("Deleting pod {}", pod.name);
        match self.pod_ops.delete_pod(&pod.namespace, &pod.name).await {
            Ok(()) => Ok(()),
            Err(KubeError::NotFound { .. }) => Err(StopError::NotFound {
                name: pod.name.clone(),
            }),
            Err(source) => Err(StopError::TransportFailed {
                name: pod.name.clone(),
                source,
            }),
        }
    }
}

impl<T: PodOperations + ?Sized + 'static> Session<T> {
    /// Observe the pod until it terminates, without blocking the caller.
    ///
    /// Each call opens its own watch on a background task.
    pub fn wait(&self) -> Completion {
        let (tx, rx) = oneshot::channel();

        let Some(pod) = self.running_pod() else {
            let _ = tx.send(Err(WaitError::NotStarted));
            return Completion { rx };
        };

        let watch = PhaseWatch::new(Arc::clone(&self.pod_ops), pod.clone());
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let name = watch.pod().name.clone();
            let outcome = watch
                .until(&cancel, Reopen::WhileObserved, |phase| match phase {
                    PodPhase::Succeeded => Some(Ok(())),
                    PodPhase::Failed | PodPhase::Unknown => Some(Err(WaitError::PodFailed {
                        name: name.clone(),
                        phase,
                    })),
                    PodPhase::Pending | PodPhase::Running => None,
                })
                .await
                .map_err(|e| match e {
                    WatchError::Open(source) | WatchError::Stream(source) => WaitError::Watch {
                        name: name.clone(),
                        source,
                    },
                    WatchError::Closed => WaitError::WatchClosed { name: name.clone() },
                    WatchError::Cancelled => WaitError::Cancelled { name: name.clone() },
                })
                .and_then(|decided| decided);

            match &outcome {
                Ok(()) => tracing::info!("Pod {} succeeded", name),
                Err(e) => tracing::warn!("Wait on pod {} ended: {}", name, e),
            }
            let _ = tx.send(outcome);
        });

        Completion { rx }
    }
}

/// Result of [`Session::wait`], delivered once
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), WaitError>>,
}

impl Future for Completion {
    type Output = Result<(), WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(WaitError::Abandoned)))
    }
}
