use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RestartError {
    /// A custom restarter delegated the restart to an external
    /// supervisor; callers treat this as success.
    #[error("restart deferred")]
    Deferred,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Restarts the agent process using the installed binary. The default
/// implementation replaces the process image, so a successful restart
/// never returns.
pub trait Restarter: Send + Sync {
    fn restart(
        &self,
        binary_path: &Path,
        args: &[String],
        env: Option<&[(String, String)]>,
    ) -> Result<(), RestartError>;
}

/// In-place process replacement (execve).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecRestarter;

impl Restarter for ExecRestarter {
    #[cfg(unix)]
    fn restart(
        &self,
        binary_path: &Path,
        args: &[String],
        env: Option<&[(String, String)]>,
    ) -> Result<(), RestartError> {
        use std::os::unix::process::CommandExt;

        if binary_path.as_os_str().is_empty() {
            return Err(RestartError::Invalid(
                "binary path required for restart".into(),
            ));
        }

        let mut command = std::process::Command::new(binary_path);
        if let Some((argv0, rest)) = args.split_first() {
            command.arg0(argv0);
            command.args(rest);
        }
        if let Some(env) = env {
            command.env_clear();
            command.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        info!(binary = %binary_path.display(), "replacing process image");
        // exec only returns on failure.
        Err(RestartError::Io(command.exec()))
    }

    #[cfg(not(unix))]
    fn restart(
        &self,
        _binary_path: &Path,
        _args: &[String],
        _env: Option<&[(String, String)]>,
    ) -> Result<(), RestartError> {
        Err(RestartError::Invalid(
            "in-place restart is only supported on unix".into(),
        ))
    }
}
