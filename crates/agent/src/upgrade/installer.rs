use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

/// Metadata about an installation attempt, kept for rollback.
#[derive(Debug, Clone, Default)]
pub struct InstallResult {
    pub target_path: PathBuf,
    pub backup_path: PathBuf,
}

/// Installs a staged binary into the target location.
pub trait Installer: Send + Sync {
    fn install(&self, source_path: &Path) -> anyhow::Result<InstallResult>;
    fn rollback(&self, result: &InstallResult) -> anyhow::Result<()>;
}

/// Replaces the current executable with the staged binary, keeping a
/// `.bak` copy for rollback. The swap is write-temp, chmod, rename.
pub struct BinaryInstaller {
    /// Explicit target; `None` resolves the current executable.
    pub target_path: Option<PathBuf>,
}

impl BinaryInstaller {
    fn target_executable(&self) -> anyhow::Result<PathBuf> {
        if let Some(target) = &self.target_path {
            if !target.as_os_str().is_empty() {
                return Ok(target.clone());
            }
        }
        let exe = std::env::current_exe().context("determine executable")?;
        exe.canonicalize().context("resolve executable")
    }
}

impl Installer for BinaryInstaller {
    fn install(&self, source_path: &Path) -> anyhow::Result<InstallResult> {
        let target = self.target_executable()?;
        if source_path.as_os_str().is_empty() {
            anyhow::bail!("source path required");
        }
        let source_meta = std::fs::metadata(source_path).context("stat source")?;
        if !source_meta.is_file() {
            anyhow::bail!("source {} is not a regular file", source_path.display());
        }

        let backup = path_with_suffix(&target, ".bak");
        let temp = path_with_suffix(&target, ".tmp");

        // A leftover temp from a crashed attempt is stale.
        match std::fs::remove_file(&temp) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).context("remove temp"),
        }

        let mut have_backup = false;
        let target_mode = match std::fs::metadata(&target) {
            Ok(meta) => {
                match std::fs::remove_file(&backup) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err).context("remove backup"),
                }
                std::fs::rename(&target, &backup).context("backup current binary")?;
                have_backup = true;
                file_mode(&meta)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0o755,
            Err(err) => return Err(err).context("stat target"),
        };

        let staged = copy_binary(source_path, &temp, &source_meta)
            .and_then(|()| set_mode(&temp, target_mode).context("chmod temp binary"))
            .and_then(|()| std::fs::rename(&temp, &target).context("publish binary"));
        if let Err(err) = staged {
            let _ = std::fs::remove_file(&temp);
            if have_backup && backup.exists() {
                let _ = std::fs::rename(&backup, &target);
            }
            return Err(err);
        }

        info!(target = %target.display(), backup = %backup.display(), "binary installed");
        Ok(InstallResult {
            target_path: target,
            backup_path: if have_backup { backup } else { PathBuf::new() },
        })
    }

    fn rollback(&self, result: &InstallResult) -> anyhow::Result<()> {
        if result.backup_path.as_os_str().is_empty() || result.target_path.as_os_str().is_empty() {
            return Ok(());
        }
        match std::fs::metadata(&result.backup_path) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        info!(backup = %result.backup_path.display(), "rolling back installed binary");
        std::fs::rename(&result.backup_path, &result.target_path).context("rollback rename")
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

fn copy_binary(
    source: &Path,
    dest: &Path,
    source_meta: &std::fs::Metadata,
) -> anyhow::Result<()> {
    use std::io::Write;

    let mut input = std::fs::File::open(source).context("open source")?;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(file_mode(source_meta));
    }
    #[cfg(not(unix))]
    let _ = source_meta;
    let mut output = options.open(dest).context("open dest")?;
    std::io::copy(&mut input, &mut output).context("copy file")?;
    output.flush().context("flush file")?;
    output.sync_all().context("sync file")?;
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o755
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
