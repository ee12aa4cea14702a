use crate::error::{KubeError, KubeResult};
use crate::kube::traits::{
    AttachOptions, AttachedStreams, PhaseEvent, PhaseEventStream, PodOperations,
};
use async_trait::async_trait;
use common::PodPhase;
use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{AttachParams, DeleteParams, PostParams, WatchEvent, WatchParams},
    Api, Client,
};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// Buffered phase events per watch before the forwarding task waits on the reader
const WATCH_BUFFER: usize = 16;

/// Real Kubernetes client implementation using kube-rs
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Build a client from explicit connection settings.
    ///
    /// Does not contact the cluster. Must be called from within a Tokio runtime.
    pub fn from_config(config: kube::Config) -> KubeResult<Self> {
        let client = Client::try_from(config)?;
        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Translate a raw watch notification. Bookmarks carry no phase and are dropped.
fn phase_event(event: WatchEvent<Pod>) -> Option<KubeResult<PhaseEvent>> {
    let (pod, deleted) = match event {
        WatchEvent::Added(pod) | WatchEvent::Modified(pod) => (pod, false),
        WatchEvent::Deleted(pod) => (pod, true),
        WatchEvent::Bookmark(_) => return None,
        WatchEvent::Error(response) => {
            return Some(Err(KubeError::Api {
                code: response.code,
                message: response.message,
            }))
        }
    };

    let name = pod.metadata.name.clone().unwrap_or_default();
    let phase = if deleted {
        PodPhase::Unknown
    } else {
        PodPhase::from_status(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
    };

    Some(Ok(PhaseEvent { name, phase }))
}

/// Pass translated watch events to a subscriber.
///
/// Returns when the server ends the watch, after the first error, or as soon
/// as the subscriber drops its receiver.
async fn forward_events<S>(events: S, tx: mpsc::Sender<KubeResult<PhaseEvent>>)
where
    S: Stream<Item = Result<WatchEvent<Pod>, kube::Error>>,
{
    futures::pin_mut!(events);

    loop {
        let next = tokio::select! {
            _ = tx.closed() => break,
            next = events.try_next() => next,
        };
        let item = match next {
            Ok(Some(event)) => match phase_event(event) {
                Some(item) => item,
                None => continue,
            },
            Ok(None) => break,
            Err(e) => Err(KubeError::Stream(e.to_string())),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

#[async_trait]
impl PodOperations for KubeClient {
    async fn create_pod(&self, namespace: &str, pod: Pod) -> KubeResult<Pod> {
        let created = self.pods(namespace).create(&PostParams::default(), &pod).await?;
        Ok(created)
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> KubeResult<PhaseEventStream> {
        let pods = self.pods(namespace);
        let params = WatchParams::default().labels(label_selector);
        let selector = label_selector.to_string();

        // The watch stream borrows the Api, so it lives on its own task and
        // is handed to the caller through a channel.
        let (opened_tx, opened_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        tokio::spawn(async move {
            let events = match pods.watch(&params, "0").await {
                Ok(events) => {
                    let _ = opened_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(KubeError::from(e)));
                    return;
                }
            };
            forward_events(events, tx).await;
            tracing::debug!("Watch with selector {} finished", selector);
        });

        opened_rx
            .await
            .map_err(|_| KubeError::Connection("watch task ended before opening".to_string()))??;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn attach(
        &self,
        namespace: &str,
        name: &str,
        options: &AttachOptions,
    ) -> KubeResult<AttachedStreams> {
        let params = AttachParams {
            container: Some(options.container.clone()),
            stdin: options.stdin,
            stdout: options.stdout,
            stderr: options.stderr,
            tty: options.tty,
            ..Default::default()
        };

        let mut attached = self
            .pods(namespace)
            .attach(name, &params)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref err) if err.code == 404 => {
                    KubeError::NotFound { name: name.into() }
                }
                other => KubeError::from(other),
            })?;

        let stdin = attached
            .stdin()
            .map(|w| Box::pin(w) as Pin<Box<dyn AsyncWrite + Send>>);
        let stdout = attached
            .stdout()
            .map(|r| Box::pin(r) as Pin<Box<dyn AsyncRead + Send>>);
        let stderr = attached
            .stderr()
            .map(|r| Box::pin(r) as Pin<Box<dyn AsyncRead + Send>>);

        let completion = Box::pin(async move {
            attached
                .join()
                .await
                .map_err(|e| KubeError::Stream(e.to_string()))
        });

        Ok(AttachedStreams {
            stdin,
            stdout,
            stderr,
            completion,
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> KubeResult<()> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(KubeError::NotFound { name: name.into() })
            }
            Err(e) => Err(e.into()),
        }
    }
}
