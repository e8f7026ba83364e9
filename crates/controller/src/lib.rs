pub mod app_state;
pub mod artifacts;
pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod persistence;
pub mod routes;
pub mod telemetry;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::AppState;
use crate::artifacts::{ArtifactStore, FileStore};
use crate::persistence::{MemoryStore, PlanStore, SqliteStore};

/// Boot the controller and serve until Ctrl+C / SIGTERM.
pub async fn run() -> Result<()> {
    run_with_shutdown(shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let cfg = config::load()?;
    let metrics_handle = telemetry::init_metrics_recorder();

    let store: Arc<dyn PlanStore> = match cfg.database_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            info!(%url, "using sqlite plan repository");
            Arc::new(SqliteStore::connect(url).await?)
        }
        _ => {
            info!("DATABASE_URL not set; using in-memory repositories");
            Arc::new(MemoryStore::new())
        }
    };

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(FileStore::with_copy_buffer(
        &cfg.artifacts_dir,
        cfg.artifact_copy_buffer_bytes,
    )?);
    info!(
        dir = %cfg.artifacts_dir,
        copy_buffer_bytes = cfg.artifact_copy_buffer_bytes,
        "artifact repository ready"
    );

    let grace = Duration::from_secs(cfg.shutdown_grace_secs.max(1));
    let listen_addr = cfg.listen_addr.clone();
    let state = AppState {
        cfg,
        store,
        artifacts,
        metrics_handle,
    };
    let app = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "controller listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx.send(true);
    });

    let mut graceful_rx = shutdown_rx.clone();
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = graceful_rx.changed().await;
            })
            .await
    });

    let mut grace_rx = shutdown_rx;
    tokio::select! {
        res = &mut server_task => {
            res.map_err(|err| anyhow::anyhow!("controller task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("controller server failed: {err}"))?;
        }
        _ = async {
            let _ = grace_rx.changed().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = grace.as_secs(), "graceful shutdown timed out; aborting server");
            server_task.abort();
        }
    }

    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
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
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
