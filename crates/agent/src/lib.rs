use std::time::Duration;

pub mod backfill;
pub mod config;
pub mod events;
pub mod queue;
pub mod runner;
pub mod spill;
pub mod state;
pub mod telemetry;
pub mod transmit;
pub mod upgrade;
pub mod uplink;

pub const USER_AGENT: &str = concat!("pulsemon-agent/", env!("CARGO_PKG_VERSION"));

/// Default timeout for plan, report, and uplink calls.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(Into::into)
}

/// HTTP client without the request timeout, for artifact downloads that
/// are bounded by the caller instead.
pub fn build_download_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_carries_crate_version() {
        assert!(USER_AGENT.starts_with("pulsemon-agent/"));
        assert!(!USER_AGENT.ends_with('/'));
    }

    #[test]
    fn clients_build() {
        build_client().expect("client");
        build_download_client().expect("download client");
    }
}
