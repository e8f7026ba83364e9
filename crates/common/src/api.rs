//! Shared API DTOs used across the controller and the agent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single upgrade attempt (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStatus {
    /// The new binary was installed and the agent restarted.
    Success,
    /// The attempt failed; `details.stage` names the failing stage.
    Failed,
    /// A gate (pause, schedule, version equality) skipped the attempt.
    Skipped,
}

impl UpgradeStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeStatus::Success => "success",
            UpgradeStatus::Failed => "failed",
            UpgradeStatus::Skipped => "skipped",
        }
    }
}

/// Artifact block of an upgrade plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanArtifact {
    /// Version the plan rolls out (semver string).
    pub version: String,
    /// Download URL for the artifact tarball.
    pub url: String,
    /// Expected hex SHA-256 of the artifact; empty skips the check.
    pub sha256: String,
    /// Optional URL of the detached signature.
    #[serde(default)]
    pub signature_url: String,
    /// Overrides pause and version-equality gates on the agent.
    #[serde(default)]
    pub force_apply: bool,
}

/// Rollout window of an upgrade plan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSchedule {
    /// Agents defer the plan until this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest: Option<DateTime<Utc>>,
    /// Informational end of the rollout window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<DateTime<Utc>>,
}

/// Upgrade plan payload delivered to agents.
///
/// `agent_id` is the storage key the plan was found under; for
/// channel-wide rollouts that is the synthetic `channel:<name>` key, and
/// agents persist it as the plan source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradePlan {
    /// Storage key the plan resolves to (agent id or `channel:<name>`).
    pub agent_id: String,
    /// Stamped when the plan is upserted; read back unchanged so the
    /// ETag stays stable across fetches.
    pub generated_at: DateTime<Utc>,
    /// Rollout lane this plan belongs to.
    pub channel: String,
    /// Artifact to install.
    pub artifact: PlanArtifact,
    /// Optional rollout window.
    #[serde(default)]
    pub schedule: PlanSchedule,
    /// Controller-side pause; agents skip unless force_apply is set.
    #[serde(default)]
    pub paused: bool,
    /// Operator notes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

impl Default for UpgradePlan {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            generated_at: DateTime::<Utc>::UNIX_EPOCH,
            channel: String::new(),
            artifact: PlanArtifact::default(),
            schedule: PlanSchedule::default(),
            paused: false,
            notes: String::new(),
        }
    }
}

/// Upgrade status report submitted by agents and persisted verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeReport {
    /// Reporting agent.
    pub agent_id: String,
    /// Version the attempt targeted.
    pub current_version: String,
    /// Version installed before the attempt, if any.
    #[serde(default)]
    pub previous_version: String,
    /// Channel the plan came from.
    pub channel: String,
    /// Attempt outcome.
    pub status: UpgradeStatus,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt completed.
    pub completed_at: DateTime<Utc>,
    /// Human-readable summary.
    #[serde(default)]
    pub message: String,
    /// Free-form key/value context, e.g. `stage`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

/// Metadata returned by the artifact upload endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactUploadResponse {
    /// The uploaded artifact description.
    pub artifact: UploadedArtifact,
}

/// Uploaded artifact description inside [`ArtifactUploadResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedArtifact {
    /// Generated artifact file name.
    pub name: String,
    /// Public download URL for the artifact.
    pub download_url: String,
    /// Hex SHA-256 of the stored bytes.
    pub sha256: String,
    /// Stored size in bytes.
    pub size: u64,
    /// Download URL of the companion signature, when one was uploaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_url: Option<String>,
}

/// Controller notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationSettings {
    /// Whether operators are notified when a plan is published.
    pub notify_on_publish: bool,
    /// Last change timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A single probe measurement produced by the agent pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    /// Monitor that produced the measurement.
    pub monitor_id: String,
    /// Measurement timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// Probe protocol (icmp, tcp, dns, ...).
    pub proto: String,
    /// Target address the probe resolved to.
    pub ip: String,
    /// Round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Whether the probe succeeded.
    pub success: bool,
    /// Per-monitor sequence number.
    pub seq: u64,
    /// Inter-probe jitter in milliseconds.
    pub jitter_ms: f64,
    /// Loss percentage over the sliding window.
    pub loss_window_pct: f64,
    /// Mean opinion score estimate.
    pub mos: f64,
}

/// Batch envelope the agent posts to the results endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Sending agent.
    pub agent_id: String,
    /// Send timestamp.
    pub sent_at: DateTime<Utc>,
    /// Monotone per-process batch counter.
    pub batch_seq: u64,
    /// Agent labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// The measurements in this batch.
    pub results: Vec<ProbeResult>,
}

/// Pipeline event kinds surfaced through the event recorder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    /// A queued result was moved to the disk spill log.
    QueueSpill,
    /// A queued result was discarded under pressure.
    QueueDrop,
    /// Backfill replay started.
    BackfillStart,
    /// Backfill replay drained the spill log.
    BackfillEnd,
    /// Uplink connectivity was re-established.
    Reconnect,
    /// A gap was detected in the result stream.
    Gap,
    /// The backfill limiter throttled replay.
    RateLimit,
}

/// A pipeline event with optional context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// When the event occurred.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// Monitor the event relates to, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<String>,
    /// Optional labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    /// Optional free-form details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_status_round_trips_lowercase() {
        let json = serde_json::to_string(&UpgradeStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
        let parsed: UpgradeStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(parsed, UpgradeStatus::Skipped);
    }

    #[test]
    fn plan_omits_empty_optional_fields() {
        let plan = UpgradePlan {
            agent_id: "agt_1".into(),
            channel: "stable".into(),
            artifact: PlanArtifact {
                version: "1.0.0".into(),
                url: "https://example.com/pkg.tar.gz".into(),
                sha256: "abc".into(),
                ..PlanArtifact::default()
            },
            ..UpgradePlan::default()
        };

        let json = serde_json::to_string(&plan).unwrap();
        assert!(!json.contains("notes"));
        assert!(!json.contains("earliest"));
        assert!(json.contains("\"force_apply\":false"));
    }

    #[test]
    fn plan_deserializes_with_missing_optionals() {
        let raw = r#"{
            "agent_id": "channel:stable",
            "generated_at": "2025-01-01T00:00:00Z",
            "channel": "stable",
            "artifact": {"version": "1.2.0", "url": "https://x/pkg.tgz", "sha256": "sha"}
        }"#;

        let plan: UpgradePlan = serde_json::from_str(raw).unwrap();
        assert_eq!(plan.artifact.version, "1.2.0");
        assert!(!plan.paused);
        assert!(plan.schedule.earliest.is_none());
        assert!(plan.notes.is_empty());
    }

    #[test]
    fn probe_result_uses_short_timestamp_key() {
        let result = ProbeResult {
            monitor_id: "mon-1".into(),
            success: true,
            ..ProbeResult::default()
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"ts\":"));
        assert!(json.contains("\"monitor_id\":\"mon-1\""));
    }
}
