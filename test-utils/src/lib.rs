use anyhow::{Context, Result};
/// Test utilities for integration tests
/// Manages kind cluster lifecycle and pod lookups
use common::PodPhase;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::process::{Command, Stdio};

pub const CLUSTER_NAME: &str = "kat";
pub const SESSION_NAMESPACE: &str = "kat-sessions";

/// Test fixture that manages kind cluster lifecycle
pub struct KindCluster {
    cluster_name: String,
}

impl KindCluster {
    /// Get or create the test cluster
    /// Idempotent - safe to call multiple times
    pub fn setup() -> Result<Self> {
        let cluster = Self {
            cluster_name: CLUSTER_NAME.to_string(),
        };

        if !cluster.exists()? {
            println!("Creating kind cluster: {}", CLUSTER_NAME);
            cluster.create()?;
        } else {
            println!("Using existing kind cluster: {}", CLUSTER_NAME);
        }

        cluster.ensure_namespace(SESSION_NAMESPACE)?;

        Ok(cluster)
    }

    fn exists(&self) -> Result<bool> {
        let output = Command::new("kind")
            .args(["get", "clusters"])
            .output()
            .context("Failed to execute 'kind get clusters'")?;

        if !output.status.success() {
            return Ok(false);
        }

        let clusters = String::from_utf8_lossy(&output.stdout);
        Ok(clusters.lines().any(|line| line.trim() == self.cluster_name))
    }

    /// Single-node cluster; session pods schedule on the control plane
    fn create(&self) -> Result<()> {
        let status = Command::new("kind")
            .args(["create", "cluster", "--name", &self.cluster_name])
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .context("Failed to spawn 'kind create cluster'")?;

        if !status.success() {
            anyhow::bail!("kind create cluster failed");
        }

        self.wait_for_ready()
    }

    fn wait_for_ready(&self) -> Result<()> {
        println!("Waiting for cluster nodes to be ready...");

        let status = Command::new("kubectl")
            .args([
                "--context",
                &self.context_name(),
                "wait",
                "--for=condition=Ready",
                "nodes",
                "--all",
                "--timeout=60s",
            ])
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .context("Failed to wait for nodes")?;

        if !status.success() {
            anyhow::bail!("Nodes did not become ready in time");
        }

        Ok(())
    }

    /// Create the namespace unless it already exists. Leftover pods from
    /// earlier runs are harmless since every session pod has a unique name.
    fn ensure_namespace(&self, name: &str) -> Result<()> {
        let exists = Command::new("kubectl")
            .args(["--context", &self.context_name(), "get", "namespace", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("Failed to query namespace")?
            .success();
        if exists {
            return Ok(());
        }

        println!("Creating namespace: {}", name);
        let status = Command::new("kubectl")
            .args(["--context", &self.context_name(), "create", "namespace", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("Failed to create namespace")?;

        if !status.success() {
            anyhow::bail!("Failed to create namespace: {}", name);
        }

        Ok(())
    }

    /// Get cluster name for kubectl context
    pub fn context_name(&self) -> String {
        format!("kind-{}", self.cluster_name)
    }
}

/// Delete the test cluster
/// Call this explicitly if you want to clean up
#[allow(dead_code)]
pub fn teardown_cluster() -> Result<()> {
    println!("Deleting kind cluster: {}", CLUSTER_NAME);

    let status = Command::new("kind")
        .args(["delete", "cluster", "--name", CLUSTER_NAME])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to delete cluster")?;

    if !status.success() {
        anyhow::bail!("Failed to delete cluster");
    }

    Ok(())
}

/// Whether a pod with this name exists in the namespace
pub async fn pod_exists(namespace: &str, name: &str) -> Result<bool> {
    let client = Client::try_default().await?;
    let pods: Api<Pod> = Api::namespaced(client, namespace);

    let pod = pods
        .get_opt(name)
        .await
        .context("Failed to look up pod")?;
    Ok(pod.is_some())
}

/// Current phase of a pod as reported by the API server
pub async fn pod_phase(namespace: &str, name: &str) -> Result<PodPhase> {
    let client = Client::try_default().await?;
    let pods: Api<Pod> = Api::namespaced(client, namespace);

    let pod = pods.get(name).await.context("Failed to get pod")?;
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    Ok(PodPhase::from_status(phase))
}
