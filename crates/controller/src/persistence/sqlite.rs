use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

use common::api::{
    NotificationSettings, PlanArtifact, PlanSchedule, UpgradePlan, UpgradeReport, UpgradeStatus,
};

use super::{
    build_plan, channel_plan_key, plan_etag, PlanInput, PlanStore, StoreError,
    DEFAULT_HISTORY_LIMIT,
};

/// SQLite-backed plan store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects to `url`, creating the database file when missing, and
    /// applies the embedded migrations.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("parse database url {url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("connect to {url}"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("run migrations")?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database for tests.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("connect in-memory sqlite")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("run migrations")?;
        Ok(Self { pool })
    }

    async fn fetch_plan_record(
        &self,
        key: &str,
    ) -> Result<Option<(UpgradePlan, String)>, StoreError> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT agent_id, channel, version, artifact_url, artifact_sha256,
                   artifact_signature_url, force_apply, schedule_earliest,
                   schedule_latest, paused, notes, etag, generated_at
              FROM agent_upgrade_plans
             WHERE agent_id = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            let etag = row.etag.clone();
            (row.into_plan(), etag)
        }))
    }
}

#[derive(Debug, FromRow)]
struct PlanRow {
    agent_id: String,
    channel: String,
    version: String,
    artifact_url: String,
    artifact_sha256: String,
    artifact_signature_url: String,
    force_apply: bool,
    schedule_earliest: Option<DateTime<Utc>>,
    schedule_latest: Option<DateTime<Utc>>,
    paused: bool,
    notes: String,
    etag: String,
    generated_at: DateTime<Utc>,
}

impl PlanRow {
    fn into_plan(self) -> UpgradePlan {
        UpgradePlan {
            agent_id: self.agent_id,
            generated_at: self.generated_at,
            channel: self.channel,
            artifact: PlanArtifact {
                version: self.version,
                url: self.artifact_url,
                sha256: self.artifact_sha256,
                signature_url: self.artifact_signature_url,
                force_apply: self.force_apply,
            },
            schedule: PlanSchedule {
                earliest: self.schedule_earliest,
                latest: self.schedule_latest,
            },
            paused: self.paused,
            notes: self.notes,
        }
    }
}

#[derive(Debug, FromRow)]
struct HistoryRow {
    agent_id: String,
    channel: String,
    target_version: String,
    previous_version: Option<String>,
    status: String,
    message: Option<String>,
    details_json: Option<Json<HashMap<String, serde_json::Value>>>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl HistoryRow {
    fn into_report(self) -> UpgradeReport {
        UpgradeReport {
            agent_id: self.agent_id,
            current_version: self.target_version,
            previous_version: self.previous_version.unwrap_or_default(),
            channel: self.channel,
            status: parse_status(&self.status),
            started_at: self.started_at,
            completed_at: self.completed_at,
            message: self.message.unwrap_or_default(),
            details: self.details_json.map(|json| json.0),
        }
    }
}

fn parse_status(raw: &str) -> UpgradeStatus {
    match raw {
        "success" => UpgradeStatus::Success,
        "skipped" => UpgradeStatus::Skipped,
        _ => UpgradeStatus::Failed,
    }
}

fn null_string(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[async_trait::async_trait]
impl PlanStore for SqliteStore {
    async fn fetch_upgrade_plan(
        &self,
        agent_id: &str,
        channel: &str,
    ) -> Result<(UpgradePlan, String), StoreError> {
        if let Some(found) = self.fetch_plan_record(agent_id).await? {
            return Ok(found);
        }
        if let Some(found) = self.fetch_plan_record(&channel_plan_key(channel)).await? {
            return Ok(found);
        }
        Err(StoreError::PlanNotFound)
    }

    async fn upsert_upgrade_plan(
        &self,
        input: PlanInput,
    ) -> Result<(UpgradePlan, String), StoreError> {
        let plan = build_plan(&input)?;
        let etag = plan_etag(&plan);

        sqlx::query(
            r#"
            INSERT INTO agent_upgrade_plans (
                agent_id, channel, version, artifact_url, artifact_sha256,
                artifact_signature_url, force_apply, schedule_earliest,
                schedule_latest, paused, notes, etag, generated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (agent_id) DO UPDATE SET
                channel = excluded.channel,
                version = excluded.version,
                artifact_url = excluded.artifact_url,
                artifact_sha256 = excluded.artifact_sha256,
                artifact_signature_url = excluded.artifact_signature_url,
                force_apply = excluded.force_apply,
                schedule_earliest = excluded.schedule_earliest,
                schedule_latest = excluded.schedule_latest,
                paused = excluded.paused,
                notes = excluded.notes,
                etag = excluded.etag,
                generated_at = excluded.generated_at
            "#,
        )
        .bind(&plan.agent_id)
        .bind(&plan.channel)
        .bind(&plan.artifact.version)
        .bind(&plan.artifact.url)
        .bind(&plan.artifact.sha256)
        .bind(&plan.artifact.signature_url)
        .bind(plan.artifact.force_apply)
        .bind(plan.schedule.earliest)
        .bind(plan.schedule.latest)
        .bind(plan.paused)
        .bind(&plan.notes)
        .bind(&etag)
        .bind(plan.generated_at)
        .execute(&self.pool)
        .await?;

        Ok((plan, etag))
    }

    async fn record_upgrade_report(&self, report: UpgradeReport) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_upgrade_history (
                agent_id, channel, target_version, previous_version, status,
                message, details_json, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&report.agent_id)
        .bind(&report.channel)
        .bind(&report.current_version)
        .bind(null_string(&report.previous_version))
        .bind(report.status.as_str())
        .bind(null_string(&report.message))
        .bind(report.details.map(Json))
        .bind(report.started_at)
        .bind(report.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_upgrade_history(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> Result<Vec<UpgradeReport>, StoreError> {
        let limit = if limit <= 0 {
            DEFAULT_HISTORY_LIMIT
        } else {
            limit
        };
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT agent_id, channel, target_version, previous_version, status,
                   message, details_json, started_at, completed_at
              FROM agent_upgrade_history
             WHERE agent_id = ?1
             ORDER BY completed_at DESC
             LIMIT ?2
            "#,
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(HistoryRow::into_report).collect())
    }

    async fn get_notification_settings(&self) -> Result<NotificationSettings, StoreError> {
        let row: Option<(bool, DateTime<Utc>)> = sqlx::query_as(
            "SELECT notify_on_publish, updated_at FROM controller_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((notify_on_publish, updated_at)) => Ok(NotificationSettings {
                notify_on_publish,
                updated_at,
            }),
            // Table not seeded yet: notifications default to on.
            None => Ok(NotificationSettings {
                notify_on_publish: true,
                updated_at: Utc::now(),
            }),
        }
    }

    async fn update_notification_settings(
        &self,
        notify: bool,
    ) -> Result<NotificationSettings, StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO controller_settings (id, notify_on_publish, updated_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT (id) DO UPDATE SET
                notify_on_publish = excluded.notify_on_publish,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(notify)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(NotificationSettings {
            notify_on_publish: notify,
            updated_at: now,
        })
    }
}
