//! Phase watch for a single pod.
//!
//! Every call to [`PhaseWatch::phases`] opens an independent subscription, so
//! `start` and any number of concurrent `wait`s never share a stream.

use crate::error::{KubeResult, WatchError};
use crate::kube::traits::PodOperations;
use crate::pod::PodIdentity;
use common::PodPhase;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What to do when the server closes a subscription without a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reopen {
    /// Report [`WatchError::Closed`]
    Never,
    /// Subscribe again, as long as the closed subscription showed the pod at
    /// least once. A subscription that never sees the pod means it is gone.
    WhileObserved,
}

pub struct PhaseWatch<T: PodOperations + ?Sized> {
    pod_ops: Arc<T>,
    pod: PodIdentity,
}

impl<T: PodOperations + ?Sized> PhaseWatch<T> {
    pub fn new(pod_ops: Arc<T>, pod: PodIdentity) -> Self {
        Self { pod_ops, pod }
    }

    pub fn pod(&self) -> &PodIdentity {
        &self.pod
    }

    /// Open a subscription yielding the phases of this pod only
    pub async fn phases(&self) -> KubeResult<BoxStream<'static, KubeResult<PodPhase>>> {
        let events = self
            .pod_ops
            .watch_pods(&self.pod.namespace, self.pod.selector())
            .await?;

        let name = self.pod.name.clone();
        Ok(events
            .try_filter_map(move |event| {
                let phase = (event.name == name).then_some(event.phase);
                futures::future::ready(Ok(phase))
            })
            .boxed())
    }

    /// Consume phases until `decide` returns a value.
    ///
    /// `decide` sees every observed phase in order, including repeats.
    pub async fn until<O, F>(
        &self,
        cancel: &CancellationToken,
        reopen: Reopen,
        mut decide: F,
    ) -> Result<O, WatchError>
    where
        F: FnMut(PodPhase) -> Option<O>,
    {
        loop {
            let mut phases = tokio::select! {
                _ = cancel.cancelled() => return Err(WatchError::Cancelled),
                opened = self.phases() => opened.map_err(WatchError::Open)?,
            };
            let mut observed = false;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Err(WatchError::Cancelled),
                    next = phases.next() => next,
                };

                match next {
                    Some(Ok(phase)) => {
                        tracing::debug!("Pod {} is {}", self.pod.name, phase);
                        observed = true;
                        if let Some(outcome) = decide(phase) {
                            return Ok(outcome);
                        }
                    }
                    Some(Err(e)) => return Err(WatchError::Stream(e)),
                    None => break,
                }
            }

            if reopen == Reopen::Never || !observed {
                return Err(WatchError::Closed);
            }
            tracing::debug!("Watch on pod {} closed, resubscribing", self.pod.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::error::KubeError;
    use crate::kube::mock::{MockOp, MockPodOperations};
    use crate::pod::build_pod;

    async fn created_pod(mock: &MockPodOperations) -> PodIdentity {
        let identity = PodIdentity::generate("test-ns");
        mock.create_pod(
            &identity.namespace,
            build_pod(&identity, &SessionConfig::new("alpine")),
        )
        .await
        .unwrap();
        identity
    }

    fn settled(phase: PodPhase) -> Option<PodPhase> {
        (phase != PodPhase::Pending).then_some(phase)
    }

    #[tokio::test]
    async fn test_until_returns_first_decision() {
        let mock = Arc::new(MockPodOperations::new());
        mock.script_phases(vec![PodPhase::Pending, PodPhase::Running, PodPhase::Failed]);
        let identity = created_pod(&mock).await;

        let watch = PhaseWatch::new(mock, identity);
        let phase = watch
            .until(&CancellationToken::new(), Reopen::Never, settled)
            .await
            .unwrap();

        assert_eq!(phase, PodPhase::Running);
    }

    #[tokio::test]
    async fn test_until_reports_close() {
        let mock = Arc::new(MockPodOperations::new());
        mock.hold_watches_open(false);
        let identity = created_pod(&mock).await;

        let watch = PhaseWatch::new(mock, identity);
        let result = watch
            .until(&CancellationToken::new(), Reopen::Never, settled)
            .await;

        assert!(matches!(result, Err(WatchError::Closed)));
    }

    #[tokio::test]
    async fn test_until_reopens_while_observed() {
        let mock = Arc::new(MockPodOperations::new());
        let identity = created_pod(&mock).await;
        let watch = PhaseWatch::new(mock.clone(), identity.clone());

        let waiter = tokio::spawn(async move {
            watch
                .until(&CancellationToken::new(), Reopen::WhileObserved, |phase| {
                    phase.is_terminal().then_some(phase)
                })
                .await
        });

        while mock.watch_count() < 1 {
            tokio::task::yield_now().await;
        }
        mock.close_watches(&identity.namespace, &identity.name);
        while mock.watch_count() < 2 {
            tokio::task::yield_now().await;
        }
        mock.set_phase(&identity.namespace, &identity.name, PodPhase::Succeeded);

        assert_eq!(waiter.await.unwrap().unwrap(), PodPhase::Succeeded);
    }

    #[tokio::test]
    async fn test_until_does_not_reopen_for_missing_pod() {
        let mock = Arc::new(MockPodOperations::new());
        let identity = PodIdentity::generate("test-ns");

        let watch = PhaseWatch::new(mock, identity);
        let result = watch
            .until(&CancellationToken::new(), Reopen::WhileObserved, settled)
            .await;

        assert!(matches!(result, Err(WatchError::Closed)));
    }

    #[tokio::test]
    async fn test_until_open_failure() {
        let mock = Arc::new(MockPodOperations::new());
        mock.fail_next(
            MockOp::Watch,
            KubeError::Api {
                code: 403,
                message: "forbidden".to_string(),
            },
        );
        let identity = created_pod(&mock).await;

        let watch = PhaseWatch::new(mock, identity);
        let result = watch
            .until(&CancellationToken::new(), Reopen::Never, settled)
            .await;

        assert!(matches!(
            result,
            Err(WatchError::Open(KubeError::Api { code: 403, .. }))
        ));
    }

    #[tokio::test]
    async fn test_until_cancelled() {
        let mock = Arc::new(MockPodOperations::new());
        let identity = created_pod(&mock).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let watch = PhaseWatch::new(mock, identity);
        let result = watch.until(&cancel, Reopen::Never, settled).await;

        assert!(matches!(result, Err(WatchError::Cancelled)));
    }
}
