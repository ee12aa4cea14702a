use anyhow::Context;
use kat::{detached_reader, Config, Session};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Logs go to stderr; stdout belongs to the pod
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("kat starting");
    tracing::info!("Image: {}", config.session.image);
    tracing::info!("Namespace: {}", config.session.namespace);

    let client_config = kube::Config::infer()
        .await
        .context("Failed to load Kubernetes configuration")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling session");
            on_interrupt.cancel();
        }
    });

    let settings = config.session;
    let mut session = Session::new(client_config, settings.image)?
        .namespace(settings.namespace)
        .pull_policy(settings.pull_policy)
        .envs(settings.env)
        .tty(settings.tty)
        .cancellation(cancel);

    // Off the blocking pool, so an idle terminal cannot delay exit
    let stdin = detached_reader(std::io::stdin()).context("Failed to read stdin")?;

    if let Err(e) = session.start().await {
        if session.pod().is_some() {
            if let Err(stop_err) = session.stop().await {
                tracing::warn!("Cleanup after failed start: {}", stop_err);
            }
        }
        return Err(e.into());
    }

    let completion = session.wait();
    let attached = session
        .attach(stdin, tokio::io::stdout(), tokio::io::stderr())
        .await;
    let finished = match attached {
        Ok(()) => completion.await.map_err(anyhow::Error::from),
        Err(e) => Err(e.into()),
    };

    if let Err(e) = session.stop().await {
        tracing::warn!("Failed to delete pod: {}", e);
    }

    finished
}
