use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::warn;

use common::api::UpgradePlan;

use crate::state::AgentState;
use crate::upgrade::verify::MinisignVerifier;

/// Validates artifact signatures when a plan provides one.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, artifact_path: &Path, signature_path: &Path) -> anyhow::Result<()>;
}

impl SignatureVerifier for MinisignVerifier {
    fn verify(&self, artifact_path: &Path, signature_path: &Path) -> anyhow::Result<()> {
        MinisignVerifier::verify(self, artifact_path, signature_path)
    }
}

/// Metadata about a staged upgrade.
#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    pub applied_version: String,
    pub previous_version: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub bundle_path: PathBuf,
    pub artifact_path: PathBuf,
    /// Absolute path of the primary binary inside the bundle.
    pub binary_path: PathBuf,
}

/// Stages upgrade plans: download, verify, extract.
#[async_trait]
pub trait PlanApplier: Send + Sync {
    async fn apply(&self, plan: &UpgradePlan, state: &AgentState) -> anyhow::Result<ApplyResult>;
}

pub struct Applier {
    pub data_dir: PathBuf,
    pub client: reqwest::Client,
    pub verifier: Option<Arc<dyn SignatureVerifier>>,
    /// Primary binary name expected inside extracted bundles.
    pub binary_name: String,
}

#[async_trait]
impl PlanApplier for Applier {
    async fn apply(&self, plan: &UpgradePlan, state: &AgentState) -> anyhow::Result<ApplyResult> {
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data directory required");
        }
        let version = plan.artifact.version.as_str();
        let now = Utc::now();
        let mut result = ApplyResult {
            applied_version: version.to_string(),
            previous_version: state.upgrade.applied.version.clone(),
            applied_at: Some(now),
            ..ApplyResult::default()
        };

        let bundle_dir = self.data_dir.join("upgrades").join(version);
        match std::fs::remove_dir_all(&bundle_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("clear bundle dir {}", bundle_dir.display()))
            }
        }
        std::fs::create_dir_all(&bundle_dir)
            .with_context(|| format!("create bundle dir {}", bundle_dir.display()))?;

        let artifact_path = bundle_dir.join("artifact.tar.gz");
        self.download(&plan.artifact.url, &artifact_path).await?;
        verify_sha256(&artifact_path, &plan.artifact.sha256)?;
        result.artifact_path = artifact_path.clone();

        if !plan.artifact.signature_url.is_empty() {
            let signature_path = bundle_dir.join("artifact.sig");
            self.download(&plan.artifact.signature_url, &signature_path)
                .await?;
            match &self.verifier {
                Some(verifier) => verifier
                    .verify(&artifact_path, &signature_path)
                    .context("verify signature")?,
                None => warn!(
                    version,
                    "signature verifier not configured; skipping verification"
                ),
            }
        }

        let extract_dir = bundle_dir.join("bundle");
        std::fs::create_dir_all(&extract_dir)
            .with_context(|| format!("create extract dir {}", extract_dir.display()))?;
        extract_tar_gz(&artifact_path, &extract_dir)?;

        let bundle = extract_dir
            .canonicalize()
            .with_context(|| format!("resolve bundle dir {}", extract_dir.display()))?;
        result.binary_path = bundle.join(&self.binary_name);
        result.bundle_path = bundle;
        Ok(result)
    }
}

impl Applier {
    async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("download {url}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("download {url}: status {status}");
        }

        let tmp = dest.with_extension(match dest.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.tmp"),
            None => "tmp".to_string(),
        });
        let write = async {
            let mut file = create_private_file(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            let mut response = response;
            while let Some(chunk) = response
                .chunk()
                .await
                .with_context(|| format!("read body of {url}"))?
            {
                file.write_all(&chunk)
                    .with_context(|| format!("write {}", tmp.display()))?;
            }
            file.sync_all()
                .with_context(|| format!("sync {}", tmp.display()))?;
            Ok::<(), anyhow::Error>(())
        };
        if let Err(err) = write.await {
            let _ = std::fs::remove_file(&tmp);
            return Err(err);
        }
        if let Err(err) = std::fs::rename(&tmp, dest) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("commit {}", dest.display()));
        }
        Ok(())
    }
}

fn create_private_file(path: &Path) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Recomputes the file's SHA-256 and compares case-insensitively after
/// trimming; an empty expectation skips the check.
pub fn verify_sha256(path: &Path, expected: &str) -> anyhow::Result<()> {
    let expected = expected.trim();
    if expected.is_empty() {
        return Ok(());
    }

    let mut file =
        std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("hash {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let sum = format!("{:x}", hasher.finalize());
    if !expected.eq_ignore_ascii_case(&sum) {
        anyhow::bail!("sha256 mismatch: expected {expected} got {sum}");
    }
    Ok(())
}

/// Extracts a gzip-compressed tar into `dest`, creating directories,
/// applying stored modes to regular files, and skipping every other
/// entry type as well as path-escaping names.
pub fn extract_tar_gz(archive_path: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("open archive {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar header")?;
        let path = entry.path().context("read tar entry path")?.into_owned();
        if path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        }) {
            continue;
        }
        let target = dest.join(&path);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("mkdir {}", target.display()))?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("mkdir for file {}", target.display()))?;
                }
                entry
                    .unpack(&target)
                    .with_context(|| format!("write file {}", target.display()))?;
            }
            _ => continue,
        }
    }
    Ok(())
}
