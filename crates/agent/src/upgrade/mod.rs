//! Agent-side upgrade lifecycle: poll the controller for plans, stage
//! and verify artifacts, install, restart, and report outcomes.

pub mod applier;
pub mod client;
pub mod installer;
pub mod restarter;
pub mod verify;

pub use applier::{Applier, ApplyResult, PlanApplier, SignatureVerifier};
pub use client::{ClientError, PlanClient, PlanFetch, PlanFetcher, Reporter};
pub use installer::{BinaryInstaller, InstallResult, Installer};
pub use restarter::{ExecRestarter, RestartError, Restarter};
pub use verify::MinisignVerifier;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use common::api::{UpgradePlan, UpgradeReport, UpgradeStatus};

use crate::state::{self, AgentState, PlanState, ScheduleState};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    /// argv passed to the restarted process; empty defaults to the
    /// binary path alone.
    pub args: Vec<String>,
    /// Environment for the restarted process; `None` inherits.
    pub env: Option<Vec<(String, String)>>,
}

/// Coordinates the upgrade state machine. All apply errors are caught
/// here: they land in `state.upgrade.applied.last_error` and a failed
/// history report, and polling continues.
pub struct Manager {
    cfg: ManagerConfig,
    fetcher: Arc<dyn PlanFetcher>,
    reporter: Option<Arc<dyn Reporter>>,
    applier: Option<Arc<dyn PlanApplier>>,
    installer: Option<Arc<dyn Installer>>,
    restarter: Option<Arc<dyn Restarter>>,
}

impl Manager {
    pub fn new(cfg: ManagerConfig, fetcher: Arc<dyn PlanFetcher>) -> Self {
        Self {
            cfg,
            fetcher,
            reporter: None,
            applier: None,
            installer: None,
            restarter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_applier(mut self, applier: Arc<dyn PlanApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn with_restarter(mut self, restarter: Arc<dyn Restarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }

    /// Polls immediately, then on the configured interval, until
    /// shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.cfg.data_dir.as_os_str().is_empty() {
            return Ok(());
        }
        let interval = if self.cfg.poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            self.cfg.poll_interval
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(err) = self.poll().await {
                        warn!(%err, "upgrade poll failed");
                    }
                }
            }
        }
    }

    /// One poll cycle: reload persisted state, conditional fetch,
    /// persist a fresh plan, and run it through the gates.
    pub async fn poll(&self) -> anyhow::Result<()> {
        let mut agent_state = match state::load_state(&self.cfg.data_dir) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(%err, "failed to load agent state; skipping poll");
                return Ok(());
            }
        };
        let channel = if agent_state.upgrade.channel.trim().is_empty() {
            "stable".to_string()
        } else {
            agent_state.upgrade.channel.clone()
        };
        let locally_paused = agent_state.upgrade.paused;
        let etag = agent_state.upgrade.plan.etag.clone();

        let (plan, fresh_etag) = match self.fetcher.fetch_plan(&channel, &etag).await {
            Ok(PlanFetch::NotModified) => return Ok(()),
            Ok(PlanFetch::Fresh { plan, etag }) => (plan, etag),
            Err(ClientError::PlanNotFound) => {
                debug!(%channel, "no upgrade plan for channel");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        agent_state.upgrade.plan = plan_to_state(&plan, Utc::now(), &fresh_etag);
        state::update_state(&self.cfg.data_dir, &agent_state)?;
        info!(
            version = %plan.artifact.version,
            channel = %plan.channel,
            paused = plan.paused,
            "fetched upgrade plan"
        );

        self.apply_plan(&plan, agent_state, locally_paused).await
    }

    async fn apply_plan(
        &self,
        plan: &UpgradePlan,
        mut agent_state: AgentState,
        locally_paused: bool,
    ) -> anyhow::Result<()> {
        let version = plan.artifact.version.as_str();
        if version.is_empty() {
            return Ok(());
        }
        if agent_state.agent_id.is_empty() {
            agent_state.agent_id = plan.agent_id.clone();
        }
        if locally_paused && !plan.artifact.force_apply {
            info!(version, "locally paused; skipping plan");
            return Ok(());
        }
        if plan.paused && !plan.artifact.force_apply {
            info!(version, "controller paused plan; skipping");
            return Ok(());
        }
        let now = Utc::now();
        if let Some(earliest) = plan.schedule.earliest {
            if now < earliest {
                info!(version, %earliest, "plan not within rollout window yet");
                return Ok(());
            }
        }
        if version == agent_state.upgrade.applied.version && !plan.artifact.force_apply {
            return Ok(());
        }
        let Some(applier) = &self.applier else {
            info!(version, "applier not configured; cannot apply plan");
            return Ok(());
        };

        let previous_version = agent_state.upgrade.applied.version.clone();
        agent_state.upgrade.applied.last_attempt = Some(now);

        let apply_result = match applier.apply(plan, &agent_state).await {
            Ok(result) => result,
            Err(err) => {
                return self
                    .fail_attempt(plan, agent_state, &previous_version, "apply", err)
                    .await;
            }
        };

        let install_result = match &self.installer {
            Some(installer) => match installer.install(&apply_result.binary_path) {
                Ok(result) => result,
                Err(err) => {
                    return self
                        .fail_attempt(plan, agent_state, &previous_version, "install", err)
                        .await;
                }
            },
            None => InstallResult {
                target_path: apply_result.binary_path.clone(),
                backup_path: PathBuf::new(),
            },
        };
        let target_path = if install_result.target_path.as_os_str().is_empty() {
            apply_result.binary_path.clone()
        } else {
            install_result.target_path.clone()
        };

        agent_state.upgrade.applied.version = version.to_string();
        agent_state.upgrade.applied.path = target_path.display().to_string();
        agent_state.upgrade.applied.applied_at = apply_result.applied_at;
        agent_state.upgrade.applied.last_error.clear();
        if let Err(err) = state::update_state(&self.cfg.data_dir, &agent_state) {
            warn!(%err, "failed to record apply results");
        }

        let mut details = HashMap::new();
        details.insert(
            "bundle_path".to_string(),
            serde_json::json!(apply_result.bundle_path.display().to_string()),
        );
        details.insert(
            "binary_path".to_string(),
            serde_json::json!(apply_result.binary_path.display().to_string()),
        );
        details.insert(
            "installed_path".to_string(),
            serde_json::json!(target_path.display().to_string()),
        );
        // Reported before the restart: a successful exec replaces this
        // process and nothing after it would run.
        self.report(
            plan,
            &agent_state.agent_id,
            &previous_version,
            UpgradeStatus::Success,
            &format!("applied {version}"),
            Some(details),
        )
        .await;

        if let Some(restarter) = &self.restarter {
            match restarter.restart(&target_path, &self.cfg.args, self.cfg.env.as_deref()) {
                Ok(()) => {}
                Err(RestartError::Deferred) => {
                    info!(version, "restart deferred to external supervisor");
                }
                Err(err) => {
                    agent_state.upgrade.applied.last_error = err.to_string();
                    agent_state.upgrade.applied.version = previous_version.clone();
                    if let Some(installer) = &self.installer {
                        if let Err(rollback_err) = installer.rollback(&install_result) {
                            warn!(%rollback_err, "rollback failed");
                        }
                    }
                    if let Err(state_err) = state::update_state(&self.cfg.data_dir, &agent_state) {
                        warn!(%state_err, "failed to record rollback state");
                    }
                    let mut details = HashMap::new();
                    details.insert("stage".to_string(), serde_json::json!("restart"));
                    self.report(
                        plan,
                        &agent_state.agent_id,
                        &previous_version,
                        UpgradeStatus::Failed,
                        &err.to_string(),
                        Some(details),
                    )
                    .await;
                    return Err(err.into());
                }
            }
        }

        Ok(())
    }

    async fn fail_attempt(
        &self,
        plan: &UpgradePlan,
        mut agent_state: AgentState,
        previous_version: &str,
        stage: &str,
        err: anyhow::Error,
    ) -> anyhow::Result<()> {
        agent_state.upgrade.applied.last_error = err.to_string();
        if let Err(state_err) = state::update_state(&self.cfg.data_dir, &agent_state) {
            warn!(%state_err, "failed to record attempt failure");
        }
        let mut details = HashMap::new();
        details.insert("stage".to_string(), serde_json::json!(stage));
        self.report(
            plan,
            &agent_state.agent_id,
            previous_version,
            UpgradeStatus::Failed,
            &err.to_string(),
            Some(details),
        )
        .await;
        Err(err)
    }

    async fn report(
        &self,
        plan: &UpgradePlan,
        agent_id: &str,
        previous_version: &str,
        status: UpgradeStatus,
        message: &str,
        details: Option<HashMap<String, serde_json::Value>>,
    ) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        let now = Utc::now();
        let report = UpgradeReport {
            agent_id: agent_id.to_string(),
            current_version: plan.artifact.version.clone(),
            previous_version: previous_version.to_string(),
            channel: plan.channel.clone(),
            status,
            started_at: now,
            completed_at: now,
            message: message.to_string(),
            details,
        };
        if let Err(err) = reporter.report_upgrade(&report).await {
            warn!(%err, "failed to report upgrade status");
        }
    }
}

fn plan_to_state(plan: &UpgradePlan, now: DateTime<Utc>, etag: &str) -> PlanState {
    PlanState {
        version: plan.artifact.version.clone(),
        channel: plan.channel.clone(),
        source: plan.agent_id.clone(),
        paused: plan.paused,
        artifact_url: plan.artifact.url.clone(),
        signature_url: plan.artifact.signature_url.clone(),
        sha256: plan.artifact.sha256.clone(),
        force_apply: plan.artifact.force_apply,
        notes: plan.notes.clone(),
        schedule: ScheduleState {
            earliest: plan.schedule.earliest,
            latest: plan.schedule.latest,
        },
        retrieved_at: Some(now),
        etag: etag.to_string(),
    }
}
