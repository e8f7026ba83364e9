//! Plan repository and history ledger.
//!
//! A single [`PlanStore`] trait with two contract-identical backends:
//! [`memory::MemoryStore`] for `DATABASE_URL`-less operation and tests,
//! and [`sqlite::SqliteStore`] for persistent deployments. Callers hold
//! a trait object and never branch on the backend.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use common::api::{NotificationSettings, PlanArtifact, PlanSchedule, UpgradePlan, UpgradeReport};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const DEFAULT_CHANNEL: &str = "stable";
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upgrade plan not found")]
    PlanNotFound,
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Other(err.into())
    }
}

/// Admin input for a plan upsert.
#[derive(Debug, Clone, Default)]
pub struct PlanInput {
    pub agent_id: String,
    pub channel: String,
    pub version: String,
    pub artifact_url: String,
    pub artifact_sha256: String,
    pub signature_url: String,
    pub force_apply: bool,
    pub schedule_earliest: Option<DateTime<Utc>>,
    pub schedule_latest: Option<DateTime<Utc>>,
    pub paused: bool,
    pub notes: String,
}

/// Persistence operations required by the upgrade API.
#[async_trait::async_trait]
pub trait PlanStore: Send + Sync {
    /// Resolves the plan for an agent, falling back to the channel-wide
    /// plan; misses surface as [`StoreError::PlanNotFound`].
    async fn fetch_upgrade_plan(
        &self,
        agent_id: &str,
        channel: &str,
    ) -> Result<(UpgradePlan, String), StoreError>;

    async fn upsert_upgrade_plan(
        &self,
        input: PlanInput,
    ) -> Result<(UpgradePlan, String), StoreError>;

    async fn record_upgrade_report(&self, report: UpgradeReport) -> Result<(), StoreError>;

    /// Newest-first history for an agent; `limit <= 0` uses the default.
    async fn list_upgrade_history(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> Result<Vec<UpgradeReport>, StoreError>;

    async fn get_notification_settings(&self) -> Result<NotificationSettings, StoreError>;

    async fn update_notification_settings(
        &self,
        notify: bool,
    ) -> Result<NotificationSettings, StoreError>;
}

/// Lowercases and trims a channel name; empty defaults to `stable`.
pub fn normalize_channel(channel: &str) -> String {
    let normalized = channel.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        DEFAULT_CHANNEL.to_string()
    } else {
        normalized
    }
}

/// Synthetic storage key for channel-wide plans.
pub fn channel_plan_key(channel: &str) -> String {
    format!("channel:{}", normalize_channel(channel))
}

/// Content-derived ETag: hex SHA-256 of the canonical JSON plan body,
/// enclosed in quotes HTTP-style. Byte-equal plans share an ETag across
/// processes because serde_json serializes fields in declaration order.
pub fn plan_etag(plan: &UpgradePlan) -> String {
    let payload = serde_json::to_vec(plan).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    format!("\"{:x}\"", hasher.finalize())
}

/// Builds the stored plan for an upsert. A blank `agent_id` targets the
/// whole channel; the stored plan's `agent_id` reflects the actual
/// storage key so agents persist the synthetic key as the plan source.
pub fn build_plan(input: &PlanInput) -> Result<UpgradePlan, StoreError> {
    if input.version.trim().is_empty() {
        return Err(StoreError::InvalidInput("version is required".into()));
    }
    if let (Some(earliest), Some(latest)) = (input.schedule_earliest, input.schedule_latest) {
        if earliest > latest {
            return Err(StoreError::InvalidInput(
                "schedule.earliest must not be after schedule.latest".into(),
            ));
        }
    }

    let channel = normalize_channel(&input.channel);
    let agent_key = {
        let trimmed = input.agent_id.trim();
        if trimmed.is_empty() {
            channel_plan_key(&channel)
        } else {
            trimmed.to_string()
        }
    };

    Ok(UpgradePlan {
        agent_id: agent_key,
        generated_at: Utc::now(),
        channel,
        artifact: PlanArtifact {
            version: input.version.clone(),
            url: input.artifact_url.clone(),
            sha256: input.artifact_sha256.clone(),
            signature_url: input.signature_url.clone(),
            force_apply: input.force_apply,
        },
        schedule: PlanSchedule {
            earliest: input.schedule_earliest,
            latest: input.schedule_latest,
        },
        paused: input.paused,
        notes: input.notes.clone(),
    })
}
