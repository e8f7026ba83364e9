use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    agent::telemetry::init_tracing();

    let cfg = agent::config::load_from_env()?;
    let handle = agent::runner::start_agent(cfg).await?;

    shutdown_signal().await;
    info!("shutting down");
    handle.shutdown().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
