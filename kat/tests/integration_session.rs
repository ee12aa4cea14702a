/// Integration tests for pod sessions
/// These tests run against a real kind cluster
///
/// Run with: cargo test --test integration_session -- --ignored --test-threads=1
use common::PodPhase;
use kat::{Session, StopError};
use std::time::Duration;
use test_utils::{pod_exists, pod_phase, KindCluster, SESSION_NAMESPACE};

/// Setup function that runs before each test
fn setup() -> KindCluster {
    // This is idempotent - safe to call for every test
    KindCluster::setup().expect("Failed to setup kind cluster")
}

async fn client_config() -> kube::Config {
    kube::Config::infer()
        .await
        .expect("Failed to load kubeconfig")
}

#[tokio::test]
#[ignore] // Run explicitly with --ignored flag
async fn test_session_runs_shell() -> Result<(), Box<dyn std::error::Error>> {
    let _cluster = setup();

    let mut session = Session::new(client_config().await, "alpine")?
        .namespace(SESSION_NAMESPACE)
        .env("GREETING", "hi");

    session.start().await?;
    let pod = session.pod().expect("started session has a pod").clone();
    assert_eq!(
        pod_phase(SESSION_NAMESPACE, &pod.name).await?,
        PodPhase::Running
    );

    let completion = session.wait();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    session
        .attach(&b"echo $GREETING\nexit\n"[..], &mut stdout, &mut stderr)
        .await?;

    assert!(String::from_utf8_lossy(&stdout).contains("hi"));
    completion.await?;

    session.stop().await?;
    println!("✓ Session pod {} ran and was stopped", pod.name);

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_stop_twice_reports_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let _cluster = setup();

    let mut session = Session::new(client_config().await, "alpine")?
        .namespace(SESSION_NAMESPACE)
        .pull_policy(common::PullPolicy::IfNotPresent);

    session.start().await?;
    let name = session.pod().expect("started session has a pod").name.clone();
    assert!(pod_exists(SESSION_NAMESPACE, &name).await?);

    session.stop().await?;

    // The first delete only starts graceful termination; while the pod is
    // terminating a repeated delete still succeeds
    let mut gone = false;
    for _ in 0..90 {
        if !pod_exists(SESSION_NAMESPACE, &name).await? {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(gone, "pod {} was not removed in time", name);

    let second = session.stop().await;

    assert!(matches!(second, Err(StopError::NotFound { .. })));

    Ok(())
}
