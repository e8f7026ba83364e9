//! End-to-end upgrade flows against a mocked controller: conditional
//! plan fetch, artifact staging, install, restart, reporting, rollback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use httpmock::{Method::GET, Method::POST, MockServer};
use sha2::{Digest, Sha256};

use agent::state::{self, AgentState, AppliedState, UpgradeState};
use agent::upgrade::{
    Applier, BinaryInstaller, Manager, ManagerConfig, PlanClient, RestartError, Restarter,
};
use common::api::{PlanArtifact, UpgradePlan};

struct OkRestarter;

impl Restarter for OkRestarter {
    fn restart(
        &self,
        _binary_path: &Path,
        _args: &[String],
        _env: Option<&[(String, String)]>,
    ) -> Result<(), RestartError> {
        Ok(())
    }
}

struct FailingRestarter;

impl Restarter for FailingRestarter {
    fn restart(
        &self,
        _binary_path: &Path,
        _args: &[String],
        _env: Option<&[(String, String)]>,
    ) -> Result<(), RestartError> {
        Err(RestartError::Invalid("exec failed".into()))
    }
}

fn agent_tarball(payload: &[u8]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o755);
    header.set_size(payload.len() as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, "pulsemon-agent", payload)
        .expect("append binary");
    let encoder = builder.into_inner().expect("finish tar");
    encoder.finish().expect("finish gzip")
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

struct Fixture {
    dir: tempfile::TempDir,
    target: PathBuf,
}

fn fixture(paused: bool) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("pulsemon-agent");
    std::fs::write(&target, b"old-binary").expect("seed target");

    let agent_state = AgentState {
        agent_id: "agt_1".into(),
        upgrade: UpgradeState {
            channel: "stable".into(),
            paused,
            applied: AppliedState {
                version: "1.0.0".into(),
                ..AppliedState::default()
            },
            ..UpgradeState::default()
        },
        ..AgentState::default()
    };
    state::save_state(dir.path(), &agent_state).expect("save state");
    Fixture { dir, target }
}

fn upgrade_plan(server: &MockServer, version: &str, sha256: &str, force: bool) -> UpgradePlan {
    UpgradePlan {
        agent_id: "agt_1".into(),
        generated_at: Utc::now(),
        channel: "stable".into(),
        artifact: PlanArtifact {
            version: version.into(),
            url: server.url("/artifacts/agent.tar.gz"),
            sha256: sha256.into(),
            force_apply: force,
            ..PlanArtifact::default()
        },
        ..UpgradePlan::default()
    }
}

fn manager(fixture: &Fixture, server: &MockServer, restarter: Arc<dyn Restarter>) -> Manager {
    let client = reqwest::Client::new();
    let plan_client =
        Arc::new(PlanClient::new(client.clone(), &server.url(""), "agt_1").expect("plan client"));
    let applier = Arc::new(Applier {
        data_dir: fixture.dir.path().to_path_buf(),
        client,
        verifier: None,
        binary_name: "pulsemon-agent".into(),
    });

    Manager::new(
        ManagerConfig {
            data_dir: fixture.dir.path().to_path_buf(),
            poll_interval: Duration::from_secs(3600),
            args: Vec::new(),
            env: None,
        },
        plan_client.clone(),
    )
    .with_reporter(plan_client)
    .with_applier(applier)
    .with_installer(Arc::new(BinaryInstaller {
        target_path: Some(fixture.target.clone()),
    }))
    .with_restarter(restarter)
}

#[tokio::test]
async fn force_apply_over_local_pause_installs_and_reports_success() {
    let server = MockServer::start_async().await;
    let archive = agent_tarball(b"upgraded-binary");
    let digest = sha256_hex(&archive);
    let fixture = fixture(true);
    let plan = upgrade_plan(&server, "1.2.0", &digest, true);

    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/agent/v1/upgrade/plan")
                .query_param("channel", "stable")
                .header("x-agent-id", "agt_1");
            then.status(200)
                .header("etag", "\"etag-force\"")
                .json_body_obj(&plan);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/artifacts/agent.tar.gz");
            then.status(200).body(archive.clone());
        })
        .await;
    let report_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/agent/v1/upgrade/report")
                .json_body_partial(
                    r#"{
                        "status": "success",
                        "current_version": "1.2.0",
                        "previous_version": "1.0.0",
                        "channel": "stable"
                    }"#,
                );
            then.status(204);
        })
        .await;

    let mgr = manager(&fixture, &server, Arc::new(OkRestarter));
    mgr.poll().await.expect("poll");

    report_mock.assert_async().await;
    assert_eq!(
        std::fs::read(&fixture.target).expect("target"),
        b"upgraded-binary"
    );

    let persisted = state::load_state(fixture.dir.path()).expect("state");
    assert_eq!(persisted.upgrade.applied.version, "1.2.0");
    assert_eq!(persisted.upgrade.plan.etag, "\"etag-force\"");
    assert!(persisted.upgrade.applied.last_error.is_empty());
}

#[tokio::test]
async fn restart_failure_rolls_back_and_reports_failed_stage_restart() {
    let server = MockServer::start_async().await;
    let archive = agent_tarball(b"upgraded-binary");
    let digest = sha256_hex(&archive);
    let fixture = fixture(false);
    let plan = upgrade_plan(&server, "1.2.0", &digest, false);

    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/agent/v1/upgrade/plan");
            then.status(200)
                .header("etag", "\"etag-rollback\"")
                .json_body_obj(&plan);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/artifacts/agent.tar.gz");
            then.status(200).body(archive.clone());
        })
        .await;
    let success_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/agent/v1/upgrade/report")
                .json_body_partial(r#"{"status": "success"}"#);
            then.status(204);
        })
        .await;
    let failed_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/agent/v1/upgrade/report")
                .json_body_partial(
                    r#"{"status": "failed", "details": {"stage": "restart"}}"#,
                );
            then.status(204);
        })
        .await;

    let mgr = manager(&fixture, &server, Arc::new(FailingRestarter));
    let err = mgr.poll().await.expect_err("restart fails");
    assert!(err.to_string().contains("exec failed"));

    // Success is emitted before exec, then the failure follow-up.
    success_mock.assert_async().await;
    failed_mock.assert_async().await;

    // The pre-install binary is restored byte for byte.
    assert_eq!(std::fs::read(&fixture.target).expect("target"), b"old-binary");

    let persisted = state::load_state(fixture.dir.path()).expect("state");
    assert_eq!(persisted.upgrade.applied.version, "1.0.0");
    assert!(!persisted.upgrade.applied.last_error.is_empty());
}

#[tokio::test]
async fn second_poll_with_same_etag_is_a_noop() {
    let server = MockServer::start_async().await;
    let archive = agent_tarball(b"upgraded-binary");
    let digest = sha256_hex(&archive);
    let fixture = fixture(false);
    let plan = upgrade_plan(&server, "1.2.0", &digest, false);

    let fresh_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/agent/v1/upgrade/plan")
                .matches(|req| {
                    !req.headers
                        .as_ref()
                        .map(|headers| {
                            headers
                                .iter()
                                .any(|(name, _)| name.eq_ignore_ascii_case("if-none-match"))
                        })
                        .unwrap_or(false)
                });
            then.status(200)
                .header("etag", "\"etag-once\"")
                .json_body_obj(&plan);
        })
        .await;
    let not_modified_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/agent/v1/upgrade/plan")
                .header("if-none-match", "\"etag-once\"");
            then.status(304);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/artifacts/agent.tar.gz");
            then.status(200).body(archive.clone());
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/agent/v1/upgrade/report");
            then.status(204);
        })
        .await;

    let mgr = manager(&fixture, &server, Arc::new(OkRestarter));
    mgr.poll().await.expect("first poll");
    mgr.poll().await.expect("second poll");

    fresh_mock.assert_async().await;
    not_modified_mock.assert_async().await;
}
