//! # Model Store — Content-Addressed Blob Storage
//!
//! Stores model artifacts (compiled training graphs and per-round aggregate
//! checkpoints) on the local filesystem, addressed by content:
//! `<dir>/<sha256[0:2]>/<sha256>`. A blob's id *is* the lowercase hex
//! SHA-256 of its bytes, so `put` is idempotent and replicas converge on
//! identical paths.
//!
//! ## Atomic Writes
//!
//! Blobs are written to a temp file in the same directory, then renamed.
//! A crash mid-write leaves only a `.tmp` file that the next GC sweeps.
//!
//! ## Reference Counting & GC
//!
//! Open jobs pin the models they reference; round history pins aggregate
//! checkpoints. `gc` deletes artifacts with zero pins whose file age
//! exceeds the retention horizon. Pins are in-memory and rebuilt from job
//! rows on startup.
//!
//! ## Chunked Download Framing
//!
//! Downloads are a framed sequence: one metadata frame, then data frames
//! with strictly increasing `chunk_index`, all but the last exactly
//! `chunk_size` bytes. Frames are bincode with a u32-LE length prefix.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Default download chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1_048_576;

/// Compute the content address of a blob.
pub fn content_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// True for a well-formed content id (64 lowercase hex chars).
/// Guards against path traversal through user-supplied ids.
pub fn is_valid_model_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Size and timestamp metadata for a stored artifact.
#[derive(Clone, Debug, Serialize)]
pub struct ModelStat {
    pub model_id: String,
    pub size: u64,
    pub created_at: SystemTime,
}

/// One frame of the chunked download stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ModelChunkFrame {
    Metadata {
        model_id: String,
        size: u64,
        total_chunks: u32,
        chunk_size: u32,
        sha256: String,
    },
    Data {
        chunk_index: u32,
        bytes: Vec<u8>,
    },
}

impl ModelChunkFrame {
    /// Serialize with a u32-LE length prefix.
    pub fn to_wire(&self) -> Vec<u8> {
        let body = bincode::serialize(self).expect("frame serialization is infallible");
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }
}

pub struct ModelStore {
    dir: PathBuf,
    chunk_size: usize,
    retention: Duration,
    pins: Mutex<HashMap<String, HashSet<String>>>,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>, chunk_size: usize, retention: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating blob dir {}", dir.display()))?;
        Ok(ModelStore {
            dir,
            chunk_size,
            retention,
            pins: Mutex::new(HashMap::new()),
        })
    }

    fn blob_path(&self, model_id: &str) -> PathBuf {
        self.dir.join(&model_id[0..2]).join(model_id)
    }

    /// Store a blob, returning its content id. Idempotent: an existing
    /// artifact with the same content is left untouched.
    pub fn put(&self, bytes: &[u8]) -> Result<String> {
        let model_id = content_id(bytes);
        let path = self.blob_path(&model_id);
        if path.exists() {
            return Ok(model_id);
        }
        let parent = path.parent().expect("blob path always has a parent");
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!("{}.tmp", model_id));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!(model_id = %model_id, size = bytes.len(), "stored model blob");
        Ok(model_id)
    }

    /// Read a whole artifact. `Ok(None)` when the id is unknown.
    pub fn get(&self, model_id: &str) -> Result<Option<Vec<u8>>> {
        if !is_valid_model_id(model_id) {
            return Ok(None);
        }
        match fs::read(self.blob_path(model_id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Size and creation timestamp. `Ok(None)` when the id is unknown.
    pub fn stat(&self, model_id: &str) -> Result<Option<ModelStat>> {
        if !is_valid_model_id(model_id) {
            return Ok(None);
        }
        match fs::metadata(self.blob_path(model_id)) {
            Ok(meta) => Ok(Some(ModelStat {
                model_id: model_id.to_string(),
                size: meta.len(),
                created_at: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Open an artifact as a chunk iterator for streaming download.
    /// `Ok(None)` when the id is unknown.
    pub fn open(&self, model_id: &str) -> Result<Option<ChunkReader>> {
        if !is_valid_model_id(model_id) {
            return Ok(None);
        }
        let path = self.blob_path(model_id);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        Ok(Some(ChunkReader {
            model_id: model_id.to_string(),
            file,
            size,
            chunk_size: self.chunk_size,
            next_index: 0,
            sent_metadata: false,
        }))
    }

    // ── Pinning & GC ────────────────────────────────────────────

    /// Hold a reference to an artifact on behalf of `holder` (a job id or
    /// a round tag). Pins are idempotent per holder.
    pub fn pin(&self, model_id: &str, holder: &str) {
        self.pins
            .lock()
            .unwrap()
            .entry(model_id.to_string())
            .or_default()
            .insert(holder.to_string());
    }

    pub fn unpin(&self, model_id: &str, holder: &str) {
        let mut pins = self.pins.lock().unwrap();
        if let Some(holders) = pins.get_mut(model_id) {
            holders.remove(holder);
            if holders.is_empty() {
                pins.remove(model_id);
            }
        }
    }

    pub fn pin_count(&self, model_id: &str) -> usize {
        self.pins
            .lock()
            .unwrap()
            .get(model_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Delete unpinned artifacts older than the retention horizon, plus any
    /// orphaned `.tmp` files. Returns the ids removed.
    pub fn gc(&self, now: SystemTime) -> Result<Vec<String>> {
        let pins = self.pins.lock().unwrap();
        let mut removed = Vec::new();
        for shard in fs::read_dir(&self.dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let age = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| now.duration_since(t).ok())
                    .unwrap_or(Duration::ZERO);
                let is_tmp = name.ends_with(".tmp");
                let pinned = pins.get(&name).map(|h| !h.is_empty()).unwrap_or(false);
                if is_tmp || (!pinned && age > self.retention) {
                    fs::remove_file(entry.path())?;
                    if !is_tmp {
                        tracing::info!(model_id = %name, "collected unreferenced model blob");
                        removed.push(name);
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Streams an artifact as download frames: metadata first, then data chunks
/// with strictly increasing indices.
pub struct ChunkReader {
    model_id: String,
    file: fs::File,
    size: u64,
    chunk_size: usize,
    next_index: u32,
    sent_metadata: bool,
}

impl ChunkReader {
    pub fn total_chunks(&self) -> u32 {
        self.size.div_ceil(self.chunk_size as u64) as u32
    }
}

impl Iterator for ChunkReader {
    type Item = std::io::Result<ModelChunkFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.sent_metadata {
            self.sent_metadata = true;
            return Some(Ok(ModelChunkFrame::Metadata {
                model_id: self.model_id.clone(),
                size: self.size,
                total_chunks: self.total_chunks(),
                chunk_size: self.chunk_size as u32,
                sha256: self.model_id.clone(),
            }));
        }
        if self.next_index >= self.total_chunks() {
            return None;
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Some(Err(e)),
            }
        }
        buf.truncate(filled);
        let frame = ModelChunkFrame::Data {
            chunk_index: self.next_index,
            bytes: buf,
        };
        self.next_index += 1;
        Some(Ok(frame))
    }
}

/// Reassemble and verify a framed download (client side / tests).
///
/// Checks frame order, chunk sizing, total size, and the full-stream SHA-256
/// against the metadata frame.
pub fn reassemble(frames: &[ModelChunkFrame]) -> Result<Vec<u8>> {
    let (meta, data) = frames.split_first().context("empty frame stream")?;
    let (size, total_chunks, chunk_size, sha256) = match meta {
        ModelChunkFrame::Metadata {
            size,
            total_chunks,
            chunk_size,
            sha256,
            ..
        } => (*size, *total_chunks, *chunk_size as usize, sha256.clone()),
        ModelChunkFrame::Data { .. } => anyhow::bail!("first frame must be metadata"),
    };
    anyhow::ensure!(data.len() as u32 == total_chunks, "chunk count mismatch");
    let mut bytes = Vec::with_capacity(size as usize);
    for (i, frame) in data.iter().enumerate() {
        match frame {
            ModelChunkFrame::Data { chunk_index, bytes: chunk } => {
                anyhow::ensure!(*chunk_index == i as u32, "out-of-order chunk {}", chunk_index);
                let is_last = i as u32 == total_chunks - 1;
                anyhow::ensure!(
                    if is_last { chunk.len() <= chunk_size } else { chunk.len() == chunk_size },
                    "chunk {} has wrong size {}",
                    chunk_index,
                    chunk.len()
                );
                bytes.extend_from_slice(chunk);
            }
            ModelChunkFrame::Metadata { .. } => anyhow::bail!("duplicate metadata frame"),
        }
    }
    anyhow::ensure!(bytes.len() as u64 == size, "total size mismatch");
    anyhow::ensure!(content_id(&bytes) == sha256, "content digest mismatch");
    Ok(bytes)
}
