//! Segmented append-only spill log for probe results.
//!
//! Records are a 4-byte big-endian length prefix followed by the
//! JSON-encoded result. Segments rotate at `segment_size`; a sidecar
//! `state.json` persists the reader head `{head_seq, head_offset}`,
//! always pointing at the first unacknowledged byte. Housekeeping runs
//! in the same critical section as appends so the head pointer is never
//! raced.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use common::api::ProbeResult;

pub const DEFAULT_MAX_BYTES: u64 = 2 << 30;
pub const DEFAULT_SEGMENT_BYTES: u64 = 64 << 20;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";
const STATE_FILE_NAME: &str = "state.json";

#[derive(Debug, Error)]
pub enum SpillError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

pub struct SpillStore {
    dir: PathBuf,
    max_bytes: u64,
    segment_size: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    segments: Vec<Segment>,
    /// Open append handle; its seq always matches the last segment.
    writer: Option<Writer>,
    head: HeadState,
    total_size: u64,
}

struct Segment {
    seq: u64,
    path: PathBuf,
    size: u64,
}

struct Writer {
    seq: u64,
    file: File,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct HeadState {
    head_seq: u64,
    head_offset: u64,
}

/// A decoded batch plus the per-entry byte extents needed to advance
/// the head precisely on acknowledgement.
#[derive(Debug, Default)]
pub struct Batch {
    pub results: Vec<ProbeResult>,
    entries: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Copy)]
struct BatchEntry {
    seq: u64,
    bytes: u64,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}

impl SpillStore {
    /// Opens (or creates) the spill directory, enumerating existing
    /// segments by numeric suffix and restoring the persisted head.
    pub fn open(dir: &Path, max_bytes: u64, segment_size: u64) -> Result<Self, SpillError> {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let max_bytes = if max_bytes == 0 {
            DEFAULT_MAX_BYTES
        } else {
            max_bytes
        };
        let segment_size = if segment_size == 0 || segment_size > max_bytes {
            max_bytes.min(DEFAULT_SEGMENT_BYTES)
        } else {
            segment_size
        };

        let segments = load_segments(dir)?;
        let total_size = segments.iter().map(|s| s.size).sum();
        let head = load_head_state(dir, &segments)?;

        let mut inner = Inner {
            segments,
            writer: None,
            head,
            total_size,
        };
        inner.ensure_writer(dir)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            max_bytes,
            segment_size,
            inner: Mutex::new(inner),
        })
    }

    /// Appends one record, fsyncs, and enforces the byte cap.
    pub fn append(&self, result: &ProbeResult) -> Result<(), SpillError> {
        let payload = serde_json::to_vec(result)?;
        let mut record = Vec::with_capacity(4 + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        record.extend_from_slice(&payload);

        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.rotate_if_needed(&self.dir, self.segment_size, record.len() as u64)?;

        let writer = inner.writer.as_mut().expect("writer after rotate");
        writer.file.write_all(&record)?;
        writer.file.sync_all()?;
        let seq = writer.seq;
        if let Some(segment) = inner.segments.iter_mut().find(|s| s.seq == seq) {
            segment.size += record.len() as u64;
        }
        inner.total_size += record.len() as u64;

        inner.enforce_max_bytes(&self.dir, self.max_bytes)
    }

    /// Decodes up to `max` records starting at the head; `max == 0`
    /// uses an internal default of 1024.
    pub fn read_batch(&self, max: usize) -> Result<Batch, SpillError> {
        let max = if max == 0 { 1024 } else { max };
        let inner = self.lock();

        let mut batch = Batch::default();
        if inner.segments.is_empty() {
            return Ok(batch);
        }

        let mut start_seq = inner.head.head_seq;
        if start_seq == 0 {
            start_seq = inner.segments[0].seq;
        }
        let mut offset = inner.head.head_offset;
        let mut seg_index = match inner.segments.iter().position(|s| s.seq == start_seq) {
            Some(index) => index,
            None => {
                // The head segment was evicted; restart at the front.
                start_seq = inner.segments[0].seq;
                offset = 0;
                0
            }
        };

        while seg_index < inner.segments.len() && batch.results.len() < max {
            let segment = &inner.segments[seg_index];
            let mut read_offset = if segment.seq == start_seq { offset } else { 0 };

            let mut file = File::open(&segment.path)?;
            file.seek(SeekFrom::Start(read_offset))?;

            while batch.results.len() < max {
                let mut len_buf = [0u8; 4];
                match file.read_exact(&mut len_buf) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(err) => return Err(err.into()),
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                match file.read_exact(&mut payload) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(err) => return Err(err.into()),
                }
                let result: ProbeResult = serde_json::from_slice(&payload)?;
                batch.results.push(result);
                batch.entries.push(BatchEntry {
                    seq: segment.seq,
                    bytes: (4 + len) as u64,
                });
                read_offset += (4 + len) as u64;
                if read_offset >= segment.size {
                    break;
                }
            }

            if read_offset < segment.size {
                // Remaining data in this segment; stop here.
                break;
            }

            offset = 0;
            seg_index += 1;
            start_seq = 0;
        }

        Ok(batch)
    }

    /// Advances the head past `batch`, deleting fully-consumed segments
    /// and persisting the head state atomically.
    pub fn ack(&self, batch: Batch) -> Result<(), SpillError> {
        if batch.entries.is_empty() {
            return Ok(());
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        for entry in &batch.entries {
            if inner.head.head_seq != entry.seq {
                // Crossed into a new segment; realign the head.
                inner.head.head_seq = entry.seq;
                inner.head.head_offset = 0;
            }
            inner.head.head_offset += entry.bytes;

            let Some(head_segment) = inner.segments.first() else {
                break;
            };
            if inner.head.head_offset >= head_segment.size {
                let path = head_segment.path.clone();
                let size = head_segment.size;
                let seq = head_segment.seq;
                std::fs::remove_file(&path)?;
                inner.total_size = inner.total_size.saturating_sub(size);
                inner.remove_head_segment(seq);
                inner.head.head_offset = 0;
                inner.head.head_seq = inner.segments.first().map(|s| s.seq).unwrap_or(0);
            }
        }

        inner.persist_head(&self.dir)
    }

    pub fn size_bytes(&self) -> u64 {
        self.lock().total_size
    }

    pub fn close(&self) -> Result<(), SpillError> {
        let mut inner = self.lock();
        if let Some(writer) = inner.writer.take() {
            writer.file.sync_all()?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("spill store poisoned")
    }
}

impl Inner {
    fn rotate_if_needed(
        &mut self,
        dir: &Path,
        segment_size: u64,
        required: u64,
    ) -> Result<(), SpillError> {
        let Some(writer_seq) = self.writer.as_ref().map(|w| w.seq) else {
            let seq = self.segments.last().map(|s| s.seq + 1).unwrap_or(1);
            return self.create_segment(dir, seq);
        };
        let current = self
            .segments
            .iter()
            .find(|s| s.seq == writer_seq)
            .map(|s| s.size)
            .unwrap_or(0);
        if current + required <= segment_size {
            return Ok(());
        }
        self.create_segment(dir, writer_seq + 1)
    }

    fn create_segment(&mut self, dir: &Path, seq: u64) -> Result<(), SpillError> {
        if let Some(writer) = self.writer.take() {
            writer.file.sync_all()?;
        }
        let path = dir.join(segment_file_name(seq));
        let file = open_segment(&path, true)?;
        self.segments.push(Segment { seq, path, size: 0 });
        self.segments.sort_by_key(|s| s.seq);
        self.writer = Some(Writer { seq, file });
        Ok(())
    }

    fn ensure_writer(&mut self, dir: &Path) -> Result<(), SpillError> {
        if self.writer.is_some() {
            return Ok(());
        }
        match self.segments.last() {
            None => self.create_segment(dir, 1),
            Some(last) => {
                let file = open_segment(&last.path, false)?;
                self.writer = Some(Writer {
                    seq: last.seq,
                    file,
                });
                Ok(())
            }
        }
    }

    fn enforce_max_bytes(&mut self, dir: &Path, max_bytes: u64) -> Result<(), SpillError> {
        while self.total_size > max_bytes && !self.segments.is_empty() {
            let head = &self.segments[0];
            let path = head.path.clone();
            let size = head.size;
            let seq = head.seq;
            std::fs::remove_file(&path)?;
            self.total_size = self.total_size.saturating_sub(size);
            self.remove_head_segment(seq);
            if self.head.head_seq == seq {
                // The reader position was evicted; restart at the first
                // remaining segment.
                self.head.head_seq = 0;
                self.head.head_offset = 0;
            }
        }
        self.persist_head(dir)
    }

    fn remove_head_segment(&mut self, seq: u64) {
        if let Some(writer) = &self.writer {
            if writer.seq == seq {
                self.writer = None;
            }
        }
        if !self.segments.is_empty() {
            self.segments.remove(0);
        }
    }

    fn persist_head(&self, dir: &Path) -> Result<(), SpillError> {
        let path = dir.join(STATE_FILE_NAME);
        let data = serde_json::to_vec(&self.head)?;
        let tmp = dir.join(format!("{STATE_FILE_NAME}.tmp"));
        std::fs::write(&tmp, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn segment_file_name(seq: u64) -> String {
    format!("{SEGMENT_PREFIX}{seq:06}{SEGMENT_SUFFIX}")
}

fn open_segment(path: &Path, create: bool) -> Result<File, SpillError> {
    let mut options = OpenOptions::new();
    options.append(true).create(create);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    Ok(options.open(path)?)
}

fn load_segments(dir: &Path) -> Result<Vec<Segment>, SpillError> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(seq_str) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        else {
            continue;
        };
        let Ok(seq) = seq_str.parse::<u64>() else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        segments.push(Segment {
            seq,
            path: entry.path(),
            size: meta.len(),
        });
    }
    segments.sort_by_key(|s| s.seq);
    Ok(segments)
}

fn load_head_state(dir: &Path, segments: &[Segment]) -> Result<HeadState, SpillError> {
    let path = dir.join(STATE_FILE_NAME);
    match std::fs::read(&path) {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(segments
            .first()
            .map(|s| HeadState {
                head_seq: s.seq,
                head_offset: 0,
            })
            .unwrap_or_default()),
        Err(err) => Err(err.into()),
    }
}
