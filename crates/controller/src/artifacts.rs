//! Artifact repository: streaming, content-addressed persistence of
//! uploaded agent binaries with crash-safe atomic publish.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::io::{AsyncRead, AsyncReadExt};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_COPY_BUFFER_BYTES: usize = 512 * 1024;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact required")]
    ArtifactRequired,
    #[error("artifact name required")]
    NameRequired,
    #[error("artifact not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Byte source for uploads; multipart fields and test slices both fit.
pub type ArtifactSource = Box<dyn AsyncRead + Send + Unpin>;

/// Seekable reader over a stored artifact.
pub trait ArtifactRead:
    tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin + std::fmt::Debug
{
}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin + std::fmt::Debug> ArtifactRead
    for T
{
}

/// An artifact upload intent.
pub struct SaveRequest {
    pub version: String,
    pub artifact_name: String,
    pub artifact: Option<ArtifactSource>,
    pub signature: Option<ArtifactSource>,
    pub signature_name: String,
}

/// Persisted artifact metadata.
#[derive(Debug, Clone, Default)]
pub struct ArtifactMeta {
    pub artifact_name: String,
    pub signature_name: String,
    pub sha256: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    pub signature_path: PathBuf,
}

/// Persistence for upgrade artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save(&self, req: SaveRequest) -> Result<ArtifactMeta, ArtifactError>;
    async fn open(
        &self,
        name: &str,
    ) -> Result<(Box<dyn ArtifactRead>, ArtifactMeta), ArtifactError>;
}

/// Free-list of copy buffers keyed on the configured size. Buffers of a
/// different size are discarded on return so a config change cannot mix
/// sizes in the pool. Under concurrent uploads this amortizes the
/// per-request 512 KiB allocation.
struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Vec<u8> {
        let mut free = self.free.lock().expect("buffer pool poisoned");
        free.pop().unwrap_or_else(|| vec![0u8; self.size])
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        let mut free = self.free.lock().expect("buffer pool poisoned");
        free.push(buf);
    }
}

/// Filesystem-backed artifact store.
pub struct FileStore {
    dir: PathBuf,
    pool: BufferPool,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::with_copy_buffer(dir, DEFAULT_COPY_BUFFER_BYTES)
    }

    pub fn with_copy_buffer(dir: impl Into<PathBuf>, buf_size: usize) -> anyhow::Result<Self> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            anyhow::bail!("artifact dir is required");
        }
        std::fs::create_dir_all(&dir)
            .map_err(|err| anyhow::anyhow!("create artifact dir {}: {err}", dir.display()))?;
        let buf_size = if buf_size == 0 {
            DEFAULT_COPY_BUFFER_BYTES
        } else {
            buf_size
        };
        Ok(Self {
            dir,
            pool: BufferPool::new(buf_size),
        })
    }

    /// Streams `src` into `tmp`, hashing on the fly, then fsyncs. The
    /// caller renames on success and removes the temp file on error.
    async fn write_stream(
        &self,
        tmp: &Path,
        src: &mut ArtifactSource,
        hasher: Option<&mut Sha256>,
    ) -> Result<u64, ArtifactError> {
        let mut file = tokio::fs::File::create(tmp).await?;
        let mut buf = self.pool.get();
        let mut hasher = hasher;
        let mut size = 0u64;
        let result = loop {
            let n = match src.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(err) => break Err(err),
            };
            if let Some(h) = hasher.as_deref_mut() {
                h.update(&buf[..n]);
            }
            if let Err(err) = file.write_all(&buf[..n]).await {
                break Err(err);
            }
            size += n as u64;
        };
        self.pool.put(buf);
        result?;
        file.sync_all().await?;
        Ok(size)
    }
}

#[async_trait]
impl ArtifactStore for FileStore {
    async fn save(&self, req: SaveRequest) -> Result<ArtifactMeta, ArtifactError> {
        let mut artifact = req.artifact.ok_or(ArtifactError::ArtifactRequired)?;

        let now = Utc::now();
        let mut base = sanitized_base(&req.version, &req.artifact_name);
        if base.is_empty() {
            base = "artifact".to_string();
        }
        let ext = normalized_ext(&req.artifact_name);
        let artifact_name = format!("{base}-{}{ext}", now.timestamp());
        let artifact_path = self.dir.join(&artifact_name);
        let tmp_path = temp_path(&artifact_path);

        let mut hasher = Sha256::new();
        let size = match self
            .write_stream(&tmp_path, &mut artifact, Some(&mut hasher))
            .await
        {
            Ok(size) => size,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        if let Err(err) = tokio::fs::rename(&tmp_path, &artifact_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        let mut signature_name = String::new();
        let mut signature_path = PathBuf::new();
        if let Some(mut signature) = req.signature {
            let sig_base = sanitized_base(&req.version, &req.signature_name);
            signature_name = build_signature_name(&sig_base, &artifact_name);
            signature_path = self.dir.join(&signature_name);
            let sig_tmp = temp_path(&signature_path);
            if let Err(err) = self.write_stream(&sig_tmp, &mut signature, None).await {
                let _ = tokio::fs::remove_file(&sig_tmp).await;
                return Err(err);
            }
            if let Err(err) = tokio::fs::rename(&sig_tmp, &signature_path).await {
                let _ = tokio::fs::remove_file(&sig_tmp).await;
                return Err(err.into());
            }
        }

        Ok(ArtifactMeta {
            artifact_name,
            signature_name,
            sha256: format!("{:x}", hasher.finalize()),
            size,
            created_at: now,
            path: artifact_path,
            signature_path,
        })
    }

    async fn open(
        &self,
        name: &str,
    ) -> Result<(Box<dyn ArtifactRead>, ArtifactMeta), ArtifactError> {
        let clean = clean_name(name)?;
        let path = self.dir.join(&clean);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound)
            }
            Err(err) => return Err(err.into()),
        };
        let stat = file.metadata().await?;
        let created_at = stat
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let meta = ArtifactMeta {
            artifact_name: clean,
            size: stat.len(),
            created_at,
            path,
            ..ArtifactMeta::default()
        };
        Ok((Box::new(file), meta))
    }
}

/// In-memory artifact store with the [`FileStore`] contract, for tests.
/// Names use nanosecond timestamps so tight loops do not collide.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    files: HashMap<String, Vec<u8>>,
    metadata: HashMap<String, ArtifactMeta>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn save(&self, req: SaveRequest) -> Result<ArtifactMeta, ArtifactError> {
        let mut artifact = req.artifact.ok_or(ArtifactError::ArtifactRequired)?;

        let now = Utc::now();
        let mut base = sanitized_base(&req.version, &req.artifact_name);
        if base.is_empty() {
            base = "artifact".to_string();
        }
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
        let artifact_name = format!("{base}-{nanos}{}", normalized_ext(&req.artifact_name));

        let mut payload = Vec::new();
        artifact.read_to_end(&mut payload).await?;
        let mut hasher = Sha256::new();
        hasher.update(&payload);

        let mut signature_name = String::new();
        let mut signature_payload = None;
        if let Some(mut signature) = req.signature {
            let mut bytes = Vec::new();
            signature.read_to_end(&mut bytes).await?;
            let sig_base = sanitized_base(&req.version, &req.signature_name);
            signature_name = build_signature_name(&sig_base, &artifact_name);
            signature_payload = Some(bytes);
        }

        let meta = ArtifactMeta {
            artifact_name: artifact_name.clone(),
            signature_name: signature_name.clone(),
            sha256: format!("{:x}", hasher.finalize()),
            size: payload.len() as u64,
            created_at: now,
            path: PathBuf::from(&artifact_name),
            signature_path: PathBuf::from(&signature_name),
        };

        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.files.insert(artifact_name.clone(), payload);
        if let Some(bytes) = signature_payload {
            inner.files.insert(signature_name, bytes);
        }
        inner.metadata.insert(artifact_name, meta.clone());
        Ok(meta)
    }

    async fn open(
        &self,
        name: &str,
    ) -> Result<(Box<dyn ArtifactRead>, ArtifactMeta), ArtifactError> {
        let clean = clean_name(name)?;
        let inner = self.inner.lock().expect("memory store poisoned");
        let data = inner
            .files
            .get(&clean)
            .cloned()
            .ok_or(ArtifactError::NotFound)?;
        let meta = inner.metadata.get(&clean).cloned().unwrap_or(ArtifactMeta {
            artifact_name: clean,
            size: data.len() as u64,
            created_at: Utc::now(),
            ..ArtifactMeta::default()
        });
        Ok((Box::new(io::Cursor::new(data)), meta))
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn clean_name(name: &str) -> Result<String, ArtifactError> {
    if name.trim().is_empty() {
        return Err(ArtifactError::NameRequired);
    }
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or(ArtifactError::NameRequired)
}

/// Prefers the version label, falling back to the uploaded file name
/// with its extension stripped; everything outside `[A-Za-z0-9._-]`
/// collapses to single dashes.
fn sanitized_base(version: &str, file_name: &str) -> String {
    for (candidate, strip_ext) in [(version, false), (file_name, true)] {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            continue;
        }
        let stem = if strip_ext {
            strip_last_ext(trimmed)
        } else {
            trimmed
        };
        let mut out = String::with_capacity(stem.len());
        let mut last_dash = false;
        for c in stem.chars() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                out.push(c);
                last_dash = false;
            } else if !last_dash {
                out.push('-');
                last_dash = true;
            }
        }
        let out = out.trim_matches(|c| c == '-' || c == '_' || c == '.');
        if !out.is_empty() {
            return out.to_string();
        }
    }
    String::new()
}

fn strip_last_ext(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 && !name[idx + 1..].contains('/') => &name[..idx],
        _ => name,
    }
}

/// Canonical extension for the stored name, preserving compound tar
/// suffixes; extensionless inputs default to `.bin`.
fn normalized_ext(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    for compound in [".tar.gz", ".tar.xz", ".tar.bz2"] {
        if lower.ends_with(compound) {
            return compound.to_string();
        }
    }
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_string(),
        _ => ".bin".to_string(),
    }
}

fn build_signature_name(base: &str, artifact_name: &str) -> String {
    if !base.is_empty() {
        return format!("{base}.sig");
    }
    if artifact_name.to_ascii_lowercase().ends_with(".sig") {
        return artifact_name.to_string();
    }
    format!("{artifact_name}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncSeekExt};

    fn source(bytes: &'static [u8]) -> ArtifactSource {
        Box::new(bytes)
    }

    fn save_request(version: &str, name: &str, payload: &'static [u8]) -> SaveRequest {
        SaveRequest {
            version: version.into(),
            artifact_name: name.into(),
            artifact: Some(source(payload)),
            signature: None,
            signature_name: String::new(),
        }
    }

    #[tokio::test]
    async fn save_then_open_round_trips_bytes_and_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");

        let meta = store
            .save(save_request("1.0.0", "agent.tar.gz", b"artifact"))
            .await
            .expect("save");
        assert!(meta.artifact_name.starts_with("1.0.0-"));
        assert!(meta.artifact_name.ends_with(".tar.gz"));
        assert_eq!(meta.size, 8);
        assert_eq!(
            meta.sha256,
            "c7c5c1d70c5dec4416ab6158afd0b223ef40c29b1dc1f97ed9428b94d4cadb1c"
        );

        let (mut reader, open_meta) = store.open(&meta.artifact_name).await.expect("open");
        assert_eq!(open_meta.size, 8);
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload).await.expect("read");
        assert_eq!(payload, b"artifact");
    }

    #[tokio::test]
    async fn open_returns_seekable_reader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");
        let meta = store
            .save(save_request("1.0.0", "agent.bin", b"0123456789"))
            .await
            .expect("save");

        let (mut reader, _) = store.open(&meta.artifact_name).await.expect("open");
        reader
            .seek(io::SeekFrom::Start(5))
            .await
            .expect("seek");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.expect("read");
        assert_eq!(rest, b"56789");
    }

    #[tokio::test]
    async fn save_requires_an_artifact_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");
        let err = store
            .save(SaveRequest {
                version: "1.0.0".into(),
                artifact_name: "a.tar.gz".into(),
                artifact: None,
                signature: None,
                signature_name: String::new(),
            })
            .await
            .expect_err("missing artifact");
        assert!(matches!(err, ArtifactError::ArtifactRequired));
    }

    #[tokio::test]
    async fn save_writes_companion_signature() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");
        let meta = store
            .save(SaveRequest {
                version: "2.1.0".into(),
                artifact_name: "agent.tar.gz".into(),
                artifact: Some(source(b"artifact")),
                signature: Some(source(b"signature-bytes")),
                signature_name: "agent.tar.gz.minisig".into(),
            })
            .await
            .expect("save");

        assert_eq!(meta.signature_name, "2.1.0.sig");
        let stored = std::fs::read(&meta.signature_path).expect("signature file");
        assert_eq!(stored, b"signature-bytes");
    }

    #[tokio::test]
    async fn save_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");
        store
            .save(save_request("1.0.0", "agent.tar.gz", b"artifact"))
            .await
            .expect("save");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn open_strips_path_components() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");
        let meta = store
            .save(save_request("1.0.0", "agent.bin", b"data"))
            .await
            .expect("save");

        let sneaky = format!("../{}", meta.artifact_name);
        let (_, open_meta) = store.open(&sneaky).await.expect("open");
        assert_eq!(open_meta.artifact_name, meta.artifact_name);

        let err = store.open("../../etc/passwd").await.expect_err("missing");
        assert!(matches!(err, ArtifactError::NotFound));
    }

    #[tokio::test]
    async fn memory_store_names_do_not_collide_in_tight_loops() {
        let store = MemoryStore::new();
        let a = store
            .save(save_request("1.0.0", "agent.tar.gz", b"one"))
            .await
            .expect("save a");
        let b = store
            .save(save_request("1.0.0", "agent.tar.gz", b"two"))
            .await
            .expect("save b");
        assert_ne!(a.artifact_name, b.artifact_name);

        let (mut reader, _) = store.open(&b.artifact_name).await.expect("open");
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload).await.expect("read");
        assert_eq!(payload, b"two");
    }

    #[test]
    fn sanitized_base_prefers_version_and_scrubs() {
        assert_eq!(sanitized_base("1.0.0", "agent.tar.gz"), "1.0.0");
        assert_eq!(sanitized_base("", "dir/agent v2.tar.gz"), "dir-agent-v2.tar");
        assert_eq!(sanitized_base("///", ""), "");
    }

    #[test]
    fn normalized_ext_keeps_compound_suffixes() {
        assert_eq!(normalized_ext("agent.tar.gz"), ".tar.gz");
        assert_eq!(normalized_ext("agent.TAR.XZ"), ".tar.xz");
        assert_eq!(normalized_ext("agent.tar.bz2"), ".tar.bz2");
        assert_eq!(normalized_ext("agent.tgz"), ".tgz");
        assert_eq!(normalized_ext("agent"), ".bin");
    }

    #[test]
    fn signature_name_falls_back_to_artifact_name() {
        assert_eq!(build_signature_name("1.0.0", "x.tar.gz"), "1.0.0.sig");
        assert_eq!(build_signature_name("", "x.tar.gz"), "x.tar.gz.sig");
        assert_eq!(build_signature_name("", "bundle.sig"), "bundle.sig");
    }

    #[test]
    fn buffer_pool_discards_mismatched_sizes() {
        let pool = BufferPool::new(16);
        let buf = pool.get();
        assert_eq!(buf.len(), 16);
        pool.put(vec![0u8; 8]);
        assert!(pool.free.lock().unwrap().is_empty());
        pool.put(buf);
        assert_eq!(pool.free.lock().unwrap().len(), 1);
    }
}
