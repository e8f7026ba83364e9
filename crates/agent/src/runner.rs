//! Wires the agent's cooperating loops together: transmitter, heartbeat
//! emitter, upgrade manager, and the metrics endpoint. Each loop is a
//! tokio task bound to a shared shutdown channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backfill;
use crate::config::Config;
use crate::queue::ResultQueue;
use crate::spill::SpillStore;
use crate::state::{self, AgentState};
use crate::telemetry::{self, MetricsBackfillRecorder, MetricsQueueRecorder};
use crate::transmit::Transmitter;
use crate::upgrade::{
    Applier, BinaryInstaller, ExecRestarter, Manager, ManagerConfig, MinisignVerifier, PlanClient,
    SignatureVerifier,
};
use crate::uplink::{heartbeat_loop, UplinkClient};

/// Handle over the running agent. The probe executor is an external
/// producer: it feeds [`AgentHandle::queue`].
pub struct AgentHandle {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    queue: Arc<ResultQueue>,
}

impl AgentHandle {
    /// Cloneable receiver that fires when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Requests a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// The live result queue probe producers enqueue into.
    pub fn queue(&self) -> Arc<ResultQueue> {
        self.queue.clone()
    }

    /// Waits for all agent tasks to finish.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        for task in self.tasks {
            if let Err(join_err) = task.await {
                if join_err.is_panic() {
                    error!(?join_err, "agent task panicked during shutdown");
                    anyhow::bail!("agent task panicked");
                }
            }
        }
        Ok(())
    }

    /// Requests shutdown and blocks until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

/// Starts the agent loops using the provided configuration.
pub async fn start_agent(cfg: Config) -> anyhow::Result<AgentHandle> {
    let data_dir = PathBuf::from(&cfg.agent.data_dir);
    let agent_state = load_or_init_state(&data_dir, &cfg)?;
    info!(
        agent_id = %agent_state.agent_id,
        server = %cfg.agent.server,
        data_dir = %data_dir.display(),
        "agent starting"
    );

    let metrics_handle = telemetry::init_metrics_recorder();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let queue = Arc::new(ResultQueue::new(cfg.queue.mem_items_cap));
    queue.set_metrics_recorder(Arc::new(MetricsQueueRecorder));

    let client = crate::build_client()?;
    let uplink = Arc::new(UplinkClient::new(
        client.clone(),
        &cfg.agent.server,
        &agent_state.agent_id,
        cfg.agent.labels.clone(),
    )?);

    let mut transmitter = Transmitter::new(queue.clone(), uplink.clone())
        .with_batch_size(cfg.transmit.batch_size)
        .with_idle_sleep(Duration::from_millis(cfg.transmit.idle_sleep_ms))
        .with_retry_sleep(Duration::from_millis(cfg.transmit.retry_sleep_ms));

    if cfg.queue.spill_to_disk {
        let spill_dir = data_dir.join("spill");
        let store = Arc::new(
            SpillStore::open(&spill_dir, cfg.disk_bytes_cap(), 0)
                .with_context(|| format!("open spill store {}", spill_dir.display()))?,
        );
        queue.attach_spill(store.clone(), cfg.queue.spill_threshold_ratio);

        let controller = Arc::new(backfill::Controller::new(store));
        controller.set_limiter(cfg.backfill.rate_per_sec, cfg.backfill.burst);
        controller.set_metrics(Arc::new(MetricsBackfillRecorder));
        transmitter = transmitter.with_backfill(controller);
    }

    {
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = transmitter.run(shutdown).await {
                error!(%err, "transmitter stopped with error");
            }
        }));
    }

    {
        let shutdown = shutdown_rx.clone();
        let uplink = uplink.clone();
        let interval = Duration::from_secs(cfg.agent.heartbeat_sec.max(1));
        tasks.push(tokio::spawn(async move {
            heartbeat_loop(uplink, interval, shutdown).await;
        }));
    }

    {
        let manager = build_upgrade_manager(&cfg, &data_dir, client)?;
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = manager.run(shutdown).await {
                error!(%err, "upgrade manager stopped with error");
            }
        }));
    }

    {
        let addr = cfg.agent.metrics_addr.clone();
        let mut shutdown = shutdown_rx.clone();
        let router = telemetry::build_metrics_router(metrics_handle);
        tasks.push(tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(%addr, %err, "failed to bind metrics listener");
                    return;
                }
            };
            info!(%addr, "agent metrics listening");
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(err) = serve.await {
                warn!(%err, "metrics server failed");
            }
        }));
    }

    Ok(AgentHandle {
        shutdown_tx,
        shutdown_rx,
        tasks,
        queue,
    })
}

fn build_upgrade_manager(
    cfg: &Config,
    data_dir: &Path,
    client: reqwest::Client,
) -> anyhow::Result<Manager> {
    let agent_state = state::load_state(data_dir)?;
    let plan_client = Arc::new(PlanClient::new(
        client,
        &cfg.agent.server,
        &agent_state.agent_id,
    )?);

    let verifier: Option<Arc<dyn SignatureVerifier>> =
        if cfg.upgrade.public_key_path.trim().is_empty() {
            None
        } else {
            let verifier =
                MinisignVerifier::from_public_key_file(Path::new(&cfg.upgrade.public_key_path))?;
            Some(Arc::new(verifier))
        };

    let applier = Arc::new(Applier {
        data_dir: data_dir.to_path_buf(),
        client: crate::build_download_client()?,
        verifier,
        binary_name: cfg.upgrade.binary_name.clone(),
    });

    let target_path = if cfg.upgrade.target_path.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(&cfg.upgrade.target_path))
    };

    Ok(Manager::new(
        ManagerConfig {
            data_dir: data_dir.to_path_buf(),
            poll_interval: Duration::from_secs(cfg.upgrade.poll_interval_secs.max(1)),
            args: std::env::args().collect(),
            env: None,
        },
        plan_client.clone(),
    )
    .with_reporter(plan_client)
    .with_applier(applier)
    .with_installer(Arc::new(BinaryInstaller { target_path }))
    .with_restarter(Arc::new(ExecRestarter)))
}

/// Loads the persisted agent state, seeding a fresh one on first boot.
/// Enrollment (credentials, certificates) is managed externally; the
/// seeded state only carries what the loops need to run.
fn load_or_init_state(data_dir: &Path, cfg: &Config) -> anyhow::Result<AgentState> {
    if state::state_path(data_dir).exists() {
        return state::load_state(data_dir);
    }
    info!(dir = %data_dir.display(), "state file missing; seeding initial state");
    let mut seeded = AgentState {
        server: cfg.agent.server.clone(),
        labels: cfg.agent.labels.clone(),
        enrolled_at: Some(chrono::Utc::now()),
        ..AgentState::default()
    };
    seeded.agent_id = format!("agt_{}", hostname_suffix());
    seeded.upgrade.channel = "stable".into();
    state::save_state(data_dir, &seeded)?;
    Ok(seeded)
}

fn hostname_suffix() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| format!("{}", std::process::id()))
}
