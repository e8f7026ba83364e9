//! Persisted per-agent state (`state.yaml`).
//!
//! Single-writer, read-modify-write with atomic temp-then-rename
//! replacement. The initial save is create-exclusive; later updates
//! overwrite. Readers must tolerate concurrent atomic replacement.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATE_FILE_NAME: &str = "state.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentState {
    pub agent_id: String,
    pub server: String,
    pub labels: HashMap<String, String>,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: String,
    pub config_path: String,
    pub credentials: Credentials,
    pub upgrade: UpgradeState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Credentials {
    pub token_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpgradeState {
    pub channel: String,
    pub paused: bool,
    pub plan: PlanState,
    pub applied: AppliedState,
}

/// The last plan fetched from the controller, kept so polling can
/// short-circuit on the ETag and gate on version equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanState {
    pub version: String,
    pub channel: String,
    /// Storage key the plan was served from (agent id or channel key).
    pub source: String,
    pub paused: bool,
    pub artifact_url: String,
    pub signature_url: String,
    pub sha256: String,
    pub force_apply: bool,
    pub notes: String,
    pub schedule: ScheduleState,
    pub retrieved_at: Option<DateTime<Utc>>,
    pub etag: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppliedState {
    pub version: String,
    pub path: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: String,
}

pub fn state_path(dir: &Path) -> PathBuf {
    dir.join(STATE_FILE_NAME)
}

pub fn load_state(dir: &Path) -> anyhow::Result<AgentState> {
    let path = state_path(dir);
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("read state file {}", path.display()))?;
    serde_yaml::from_str(&data).with_context(|| format!("parse state file {}", path.display()))
}

/// Initial save; fails if the state file already exists.
pub fn save_state(dir: &Path, state: &AgentState) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("ensure state dir {}", dir.display()))?;
    let path = state_path(dir);
    if path.exists() {
        anyhow::bail!("state file {} already exists", path.display());
    }
    write_state(&path, state)
}

/// Overwrites the state file atomically.
pub fn update_state(dir: &Path, state: &AgentState) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("ensure state dir {}", dir.display()))?;
    write_state(&state_path(dir), state)
}

fn write_state(path: &Path, state: &AgentState) -> anyhow::Result<()> {
    let data = serde_yaml::to_string(state).context("marshal state")?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, data)
        .with_context(|| format!("write temp state file {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod state file {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("commit state file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> AgentState {
        AgentState {
            agent_id: "agt_1".into(),
            server: "https://controller.example".into(),
            upgrade: UpgradeState {
                channel: "stable".into(),
                applied: AppliedState {
                    version: "1.0.0".into(),
                    ..AppliedState::default()
                },
                ..UpgradeState::default()
            },
            ..AgentState::default()
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = sample_state();
        save_state(dir.path(), &state).expect("save");

        let loaded = load_state(dir.path()).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn initial_save_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        save_state(dir.path(), &sample_state()).expect("save");
        let err = save_state(dir.path(), &sample_state()).expect_err("exists");
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn update_overwrites_atomically() {
        let dir = tempfile::tempdir().expect("tempdir");
        save_state(dir.path(), &sample_state()).expect("save");

        let mut updated = sample_state();
        updated.upgrade.applied.version = "1.2.0".into();
        updated.upgrade.plan.etag = "\"abc\"".into();
        update_state(dir.path(), &updated).expect("update");

        let loaded = load_state(dir.path()).expect("load");
        assert_eq!(loaded.upgrade.applied.version, "1.2.0");
        assert_eq!(loaded.upgrade.plan.etag, "\"abc\"");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn state_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        save_state(dir.path(), &sample_state()).expect("save");
        let mode = std::fs::metadata(state_path(dir.path()))
            .expect("stat")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn partial_yaml_loads_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            state_path(dir.path()),
            "agent_id: agt_2\nupgrade:\n  channel: canary\n",
        )
        .expect("write");

        let loaded = load_state(dir.path()).expect("load");
        assert_eq!(loaded.agent_id, "agt_2");
        assert_eq!(loaded.upgrade.channel, "canary");
        assert!(loaded.upgrade.applied.version.is_empty());
        assert!(!loaded.upgrade.paused);
    }
}
