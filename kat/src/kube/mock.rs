use crate::error::{KubeError, KubeResult};
use crate::kube::traits::{
    AttachOptions, AttachedStreams, PhaseEvent, PhaseEventStream, PodOperations,
};
use async_trait::async_trait;
use common::PodPhase;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Operations that can be made to fail once with `fail_next`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Watch,
    Attach,
    Delete,
}

/// What the simulated container process writes back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Turns the bytes written to an attached pod's stdin into its output
pub type ProcessHandler = Arc<dyn Fn(&Pod, &[u8]) -> ProcessOutput + Send + Sync>;

type Watcher = mpsc::UnboundedSender<KubeResult<PhaseEvent>>;

struct MockPod {
    pod: Pod,
    phase: PodPhase,
    script: VecDeque<PodPhase>,
    watchers: Vec<Watcher>,
    /// Fires when the pod is deleted, ending attached processes
    terminated: CancellationToken,
}

impl MockPod {
    fn name(&self) -> String {
        self.pod.metadata.name.clone().unwrap_or_default()
    }

    fn broadcast(&mut self, phase: PodPhase) {
        let event = PhaseEvent {
            name: self.name(),
            phase,
        };
        self.watchers.retain(|w| w.send(Ok(event.clone())).is_ok());
    }
}

struct MockState {
    pods: HashMap<String, MockPod>,
    created: Vec<Pod>,
    script: Vec<PodPhase>,
    hold_watches_open: bool,
    failures: HashMap<MockOp, KubeError>,
    watch_count: usize,
    attach_count: usize,
}

/// Mock implementation of PodOperations for unit testing
///
/// Created pods start out `Pending`. The phases given to `script_phases` are
/// replayed, in order, when the first watch on a pod opens; later changes are
/// pushed with `set_phase`.
#[derive(Clone)]
pub struct MockPodOperations {
    state: Arc<Mutex<MockState>>,
    handler: Arc<Mutex<ProcessHandler>>,
}

impl MockPodOperations {
    /// Create a new mock with no pods. Attached processes echo stdin to stdout.
    pub fn new() -> Self {
        let echo: ProcessHandler = Arc::new(|_: &Pod, input: &[u8]| ProcessOutput {
            stdout: input.to_vec(),
            stderr: Vec::new(),
        });

        Self {
            state: Arc::new(Mutex::new(MockState {
                pods: HashMap::new(),
                created: Vec::new(),
                script: Vec::new(),
                hold_watches_open: true,
                failures: HashMap::new(),
                watch_count: 0,
                attach_count: 0,
            })),
            handler: Arc::new(Mutex::new(echo)),
        }
    }

    /// Phases every subsequently created pod moves through once watched
    pub fn script_phases(&self, phases: Vec<PodPhase>) {
        self.state.lock().unwrap().script = phases;
    }

    /// When false, watch streams end right after the replayed phases
    pub fn hold_watches_open(&self, hold: bool) {
        self.state.lock().unwrap().hold_watches_open = hold;
    }

    /// Replace the simulated container process
    pub fn set_process<F>(&self, handler: F)
    where
        F: Fn(&Pod, &[u8]) -> ProcessOutput + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    /// Make the next call of `op` fail with `err`
    pub fn fail_next(&self, op: MockOp, err: KubeError) {
        self.state.lock().unwrap().failures.insert(op, err);
    }

    /// Move a pod to `phase` and notify its open watches
    pub fn set_phase(&self, namespace: &str, name: &str, phase: PodPhase) {
        let mut state = self.state.lock().unwrap();
        if let Some(pod) = state.pods.get_mut(&Self::make_key(namespace, name)) {
            pod.phase = phase;
            pod.broadcast(phase);
        }
    }

    /// End every open watch on a pod, as a server-side timeout would
    pub fn close_watches(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(pod) = state.pods.get_mut(&Self::make_key(namespace, name)) {
            pod.watchers.clear();
        }
    }

    /// Every pod passed to `create_pod`, in order
    pub fn created_pods(&self) -> Vec<Pod> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn contains_pod(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .pods
            .contains_key(&Self::make_key(namespace, name))
    }

    pub fn pod_phase(&self, namespace: &str, name: &str) -> Option<PodPhase> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&Self::make_key(namespace, name))
            .map(|pod| pod.phase)
    }

    pub fn watch_count(&self) -> usize {
        self.state.lock().unwrap().watch_count
    }

    pub fn attach_count(&self) -> usize {
        self.state.lock().unwrap().attach_count
    }

    fn make_key(namespace: &str, name: &str) -> String {
        format!("{}/{}", namespace, name)
    }

    fn take_failure(state: &mut MockState, op: MockOp) -> KubeResult<()> {
        match state.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
        // Simple label selector parsing: "key1=value1,key2" (bare keys test existence)
        if selector.is_empty() {
            return true;
        }

        for requirement in selector.split(',') {
            let requirement = requirement.trim();
            let matched = match requirement.split_once('=') {
                Some((key, value)) => {
                    labels.get(key.trim()).map(String::as_str) == Some(value.trim())
                }
                None => labels.contains_key(requirement),
            };

            if !matched {
                return false;
            }
        }

        true
    }
}

impl Default for MockPodOperations {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PodOperations for MockPodOperations {
    async fn create_pod(&self, namespace: &str, pod: Pod) -> KubeResult<Pod> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, MockOp::Create)?;

        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| KubeError::InvalidRequest("pod has no name".to_string()))?;
        let key = Self::make_key(namespace, &name);
        if state.pods.contains_key(&key) {
            return Err(KubeError::Api {
                code: 409,
                message: format!("pods \"{}\" already exists", name),
            });
        }

        let mut stored = pod.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some("1".to_string());

        let script = state.script.iter().copied().collect();
        state.created.push(pod);
        state.pods.insert(
            key,
            MockPod {
                pod: stored.clone(),
                phase: PodPhase::Pending,
                script,
                watchers: Vec::new(),
                terminated: CancellationToken::new(),
            },
        );

        Ok(stored)
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> KubeResult<PhaseEventStream> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, MockOp::Watch)?;
        state.watch_count += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let hold_open = state.hold_watches_open;
        let prefix = format!("{}/", namespace);

        for (key, pod) in state.pods.iter_mut() {
            let selected = key.starts_with(&prefix)
                && pod
                    .pod
                    .metadata
                    .labels
                    .as_ref()
                    .is_some_and(|labels| Self::matches_selector(labels, label_selector));
            if !selected {
                continue;
            }

            // Current state first, like a watch from resource version "0"
            let _ = tx.send(Ok(PhaseEvent {
                name: pod.name(),
                phase: pod.phase,
            }));
            if hold_open {
                pod.watchers.push(tx.clone());
            }

            while let Some(phase) = pod.script.pop_front() {
                pod.phase = phase;
                pod.broadcast(phase);
                if !hold_open {
                    let _ = tx.send(Ok(PhaseEvent {
                        name: pod.name(),
                        phase,
                    }));
                }
            }
        }

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
        let (pod, terminated) = {
            let mut state = self.state.lock().unwrap();
            Self::take_failure(&mut state, MockOp::Attach)?;
            state.attach_count += 1;

            if !options.stdin && !options.stdout && !options.stderr {
                return Err(KubeError::InvalidRequest(
                    "you must specify at least 1 of stdin, stdout, stderr".to_string(),
                ));
            }
            if options.tty && options.stderr {
                return Err(KubeError::InvalidRequest(
                    "TTY and stderr cannot both be true".to_string(),
                ));
            }

            let pod = state
                .pods
                .get(&Self::make_key(namespace, name))
                .ok_or_else(|| KubeError::NotFound {
                    name: name.to_string(),
                })?;
            if pod.phase != PodPhase::Running {
                return Err(KubeError::Api {
                    code: 400,
                    message: format!("pod {} is not running ({})", name, pod.phase),
                });
            }
            (pod.pod.clone(), pod.terminated.clone())
        };

        let handler = self.handler.lock().unwrap().clone();
        let (client_stdin, mut server_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut server_stdout, client_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut server_stderr, client_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let opts = options.clone();

        let process = tokio::spawn(async move {
            let mut input = Vec::new();
            if opts.stdin {
                tokio::select! {
                    // Killed: output channels close without a word
                    _ = terminated.cancelled() => return Ok(()),
                    read = server_stdin.read_to_end(&mut input) => read?,
                };
            }

            let output = handler(&pod, &input);
            if opts.stdout {
                server_stdout.write_all(&output.stdout).await?;
                if opts.tty {
                    server_stdout.write_all(&output.stderr).await?;
                }
                server_stdout.shutdown().await?;
            }
            if opts.stderr {
                server_stderr.write_all(&output.stderr).await?;
                server_stderr.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let completion = Box::pin(async move {
            match process.await {
                Ok(result) => result.map_err(|e| KubeError::Stream(e.to_string())),
                Err(e) => Err(KubeError::Stream(e.to_string())),
            }
        });

        Ok(AttachedStreams {
            stdin: options
                .stdin
                .then(|| Box::pin(client_stdin) as Pin<Box<dyn AsyncWrite + Send>>),
            stdout: options
                .stdout
                .then(|| Box::pin(client_stdout) as Pin<Box<dyn AsyncRead + Send>>),
            stderr: options
                .stderr
                .then(|| Box::pin(client_stderr) as Pin<Box<dyn AsyncRead + Send>>),
            completion,
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> KubeResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, MockOp::Delete)?;

        let mut pod = state
            .pods
            .remove(&Self::make_key(namespace, name))
            .ok_or_else(|| KubeError::NotFound {
                name: name.to_string(),
            })?;

        // Attached processes die, watches see the deletion, then end
        pod.terminated.cancel();
        pod.broadcast(PodPhase::Unknown);
        pod.watchers.clear();
        Ok(())
    }
}
