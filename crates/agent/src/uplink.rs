//! Uplink client: posts probe-result envelopes and heartbeats to the
//! controller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use common::api::{ProbeResult, ResultEnvelope};

use crate::transmit::Sink;

const RESULTS_PATH: &str = "/api/agent/v1/results";
const HEARTBEAT_PATH: &str = "/api/agent/v1/heartbeat";

pub struct UplinkClient {
    client: reqwest::Client,
    results_url: String,
    heartbeat_url: String,
    agent_id: String,
    labels: HashMap<String, String>,
    batch_seq: AtomicU64,
}

#[derive(Debug, Serialize)]
struct HeartbeatPayload<'a> {
    agent_id: &'a str,
    sent_at: DateTime<Utc>,
    labels: &'a HashMap<String, String>,
}

impl UplinkClient {
    pub fn new(
        client: reqwest::Client,
        server_url: &str,
        agent_id: &str,
        labels: HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        if server_url.trim().is_empty() {
            anyhow::bail!("server URL is required");
        }
        if agent_id.trim().is_empty() {
            anyhow::bail!("agent ID is required");
        }
        let base = server_url.trim_end_matches('/');
        Ok(Self {
            client,
            results_url: format!("{base}{RESULTS_PATH}"),
            heartbeat_url: format!("{base}{HEARTBEAT_PATH}"),
            agent_id: agent_id.to_string(),
            labels,
            batch_seq: AtomicU64::new(0),
        })
    }

    pub async fn send_heartbeat(&self) -> anyhow::Result<()> {
        let payload = HeartbeatPayload {
            agent_id: &self.agent_id,
            sent_at: Utc::now(),
            labels: &self.labels,
        };
        let response = self
            .client
            .post(&self.heartbeat_url)
            .header("x-agent-id", &self.agent_id)
            .json(&payload)
            .send()
            .await?;
        check_status(response.status(), "heartbeat")
    }
}

#[async_trait]
impl Sink for UplinkClient {
    async fn send(&self, results: &[ProbeResult]) -> anyhow::Result<()> {
        let envelope = ResultEnvelope {
            agent_id: self.agent_id.clone(),
            sent_at: Utc::now(),
            batch_seq: self.batch_seq.fetch_add(1, Ordering::SeqCst),
            labels: self.labels.clone(),
            results: results.to_vec(),
        };
        let response = self
            .client
            .post(&self.results_url)
            .header("x-agent-id", &self.agent_id)
            .json(&envelope)
            .send()
            .await?;
        check_status(response.status(), "results upload")
    }
}

fn check_status(status: StatusCode, what: &str) -> anyhow::Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("{what} failed: status {status}")
    }
}

/// Emits heartbeats on a fixed interval until shutdown; failures are
/// logged and retried on the next tick.
pub async fn heartbeat_loop(
    client: std::sync::Arc<UplinkClient>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                match client.send_heartbeat().await {
                    Ok(()) => debug!("heartbeat sent"),
                    Err(err) => warn!(%err, "heartbeat failed"),
                }
            }
        }
    }
}
