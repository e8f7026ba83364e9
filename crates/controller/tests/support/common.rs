#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request as HttpRequest, Response};
use axum::Router;
use http_body_util::BodyExt;

use controller::app_state::AppState;
use controller::artifacts::{ArtifactStore, FileStore};
use controller::config::{AgentAuthMode, AppConfig};
use controller::persistence::{MemoryStore, PlanStore, SqliteStore};
use controller::routes::build_router;
use controller::telemetry::init_metrics_recorder;

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

pub fn test_config() -> AppConfig {
    AppConfig {
        listen_addr: "127.0.0.1:0".into(),
        database_url: None,
        agent_auth_mode: AgentAuthMode::Header,
        admin_bearer_token: TEST_ADMIN_TOKEN.into(),
        public_base_url: String::new(),
        artifact_path: "/artifacts".into(),
        artifacts_dir: "./artifacts".into(),
        artifact_copy_buffer_bytes: 64 * 1024,
        shutdown_grace_secs: 10,
    }
}

/// Router backed by the in-memory plan store and a filesystem artifact
/// store rooted in a temp dir (returned so it outlives the test).
pub fn setup_app() -> (Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(FileStore::new(dir.path()).expect("artifact store"));
    let state = AppState {
        cfg: test_config(),
        store: Arc::new(MemoryStore::new()),
        artifacts,
        metrics_handle: init_metrics_recorder(),
    };
    (build_router(state), dir)
}

/// Router backed by the sqlite plan store (in-memory database).
pub async fn setup_sqlite_app() -> (Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(FileStore::new(dir.path()).expect("artifact store"));
    let store: Arc<dyn PlanStore> =
        Arc::new(SqliteStore::in_memory().await.expect("sqlite store"));
    let state = AppState {
        cfg: test_config(),
        store,
        artifacts,
        metrics_handle: init_metrics_recorder(),
    };
    (build_router(state), dir)
}

pub fn agent_request(uri: &str, agent_id: &str) -> HttpRequest<Body> {
    HttpRequest::builder()
        .method("GET")
        .uri(uri)
        .header("x-agent-id", agent_id)
        .body(Body::empty())
        .expect("request")
}

pub fn admin_json_request(method: &str, uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
    HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_ADMIN_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn raw_body(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
        .to_vec()
}

/// Minimal multipart encoder for upload tests.
pub struct MultipartBuilder {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartBuilder {
    pub fn new() -> Self {
        Self {
            boundary: "pulsemon-test-boundary".to_string(),
            body: Vec::new(),
        }
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, payload: &[u8]) -> Self {
        self.body
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(payload);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn build(mut self, uri: &str) -> HttpRequest<Body> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", format!("Bearer {TEST_ADMIN_TOKEN}"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", self.boundary),
            )
            .body(Body::from(self.body))
            .expect("request")
    }
}
