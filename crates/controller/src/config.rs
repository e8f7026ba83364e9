use serde::Deserialize;

pub const DEFAULT_COPY_BUFFER_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    /// Unset runs with in-memory repositories (scaffolding / tests).
    #[serde(default)]
    pub database_url: Option<String>,
    pub agent_auth_mode: AgentAuthMode,
    pub admin_bearer_token: String,
    /// Base URL advertised in artifact download links; falls back to the
    /// request host when empty.
    #[serde(default)]
    pub public_base_url: String,
    pub artifact_path: String,
    pub artifacts_dir: String,
    pub artifact_copy_buffer_bytes: usize,
    pub shutdown_grace_secs: u64,
}

/// How agent-facing endpoints identify the calling agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentAuthMode {
    /// Trust the `X-Agent-ID` header. Development only.
    Header,
    /// Trust the client-certificate common name forwarded by the
    /// TLS-terminating front end.
    Mtls,
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_addr.trim().is_empty() {
            anyhow::bail!("LISTEN_ADDR cannot be empty");
        }
        if self.artifacts_dir.trim().is_empty() {
            anyhow::bail!("ARTIFACTS_DIR cannot be empty");
        }
        if self.artifact_copy_buffer_bytes == 0 {
            anyhow::bail!("ARTIFACT_COPY_BUFFER_BYTES must be > 0");
        }
        let path = self.artifact_path.trim();
        if !path.is_empty() && !path.starts_with('/') {
            anyhow::bail!("ARTIFACT_PATH must start with '/'");
        }
        Ok(())
    }

    /// Route prefix artifacts are served under, never empty.
    pub fn artifact_route(&self) -> String {
        let trimmed = self.artifact_path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/artifacts".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::default().try_parsing(false);

    let builder = config::Config::builder()
        .add_source(env)
        .set_default("listen_addr", "0.0.0.0:8080")?
        .set_default("agent_auth_mode", "header")?
        .set_default("admin_bearer_token", "")?
        .set_default("public_base_url", "")?
        .set_default("artifact_path", "/artifacts")?
        .set_default("artifacts_dir", "./artifacts")?
        .set_default(
            "artifact_copy_buffer_bytes",
            DEFAULT_COPY_BUFFER_BYTES as u64,
        )?
        .set_default("shutdown_grace_secs", 10u64)?;

    let cfg = builder.build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}
