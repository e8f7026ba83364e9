use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use thiserror::Error;

use common::api::{UpgradePlan, UpgradeReport};

const PLAN_PATH: &str = "/api/agent/v1/upgrade/plan";
const REPORT_PATH: &str = "/api/agent/v1/upgrade/report";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("upgrade plan not found")]
    PlanNotFound,
    #[error("upgrade plan unauthorized: {0}")]
    Unauthorized(StatusCode),
    #[error("upgrade plan fetch failed: {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Outcome of a conditional plan fetch.
#[derive(Debug, Clone)]
pub enum PlanFetch {
    /// The controller returned 304 for the supplied ETag.
    NotModified,
    Fresh { plan: UpgradePlan, etag: String },
}

/// Fetches upgrade plans from the controller.
#[async_trait]
pub trait PlanFetcher: Send + Sync {
    async fn fetch_plan(&self, channel: &str, etag: &str) -> Result<PlanFetch, ClientError>;
}

/// Reports upgrade progress back to the controller.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report_upgrade(&self, report: &UpgradeReport) -> anyhow::Result<()>;
}

/// Controller upgrade plan/report client.
pub struct PlanClient {
    client: reqwest::Client,
    base_url: String,
    agent_id: String,
}

impl PlanClient {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        agent_id: &str,
    ) -> anyhow::Result<Self> {
        if base_url.trim().is_empty() {
            anyhow::bail!("base URL is required");
        }
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_id: agent_id.to_string(),
        })
    }
}

#[async_trait]
impl PlanFetcher for PlanClient {
    async fn fetch_plan(&self, channel: &str, etag: &str) -> Result<PlanFetch, ClientError> {
        let channel = {
            let trimmed = channel.trim();
            if trimmed.is_empty() {
                "stable"
            } else {
                trimmed
            }
        };

        let mut request = self
            .client
            .get(format!("{}{PLAN_PATH}", self.base_url))
            .query(&[("channel", channel)])
            .header(reqwest::header::ACCEPT, "application/json");
        if !etag.is_empty() {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if !self.agent_id.is_empty() {
            request = request.header("x-agent-id", &self.agent_id);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            Ok(PlanFetch::NotModified)
        } else if status == StatusCode::OK {
            let fresh_etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let plan: UpgradePlan = response.json().await?;
            Ok(PlanFetch::Fresh {
                plan,
                etag: fresh_etag,
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(ClientError::PlanNotFound)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ClientError::Unauthorized(status))
        } else {
            Err(ClientError::Status(status))
        }
    }
}

#[async_trait]
impl Reporter for PlanClient {
    async fn report_upgrade(&self, report: &UpgradeReport) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}{REPORT_PATH}", self.base_url))
            .header("x-agent-id", &self.agent_id)
            .json(report)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("upgrade report failed: status {status}");
        }
        Ok(())
    }
}
