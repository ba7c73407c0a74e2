//! File transfer: chunked, resumable, integrity-checked file exchange between two peers.
//!
//! Uploader offers metadata, downloader accepts and pulls chunks with `chunk-request`, keeping at
//! most `max_concurrent_chunks` outstanding. Each chunk carries its SHA-256; the whole file is
//! checked against the advertised hash before the transfer counts as completed.
//!
//! File work (whole-file hashing, chunk reads and writes) never runs on the message path. The
//! manager queues [`IoJob`]s; the host runs them off-thread and hands each [`IoOutcome`] back
//! through [`TransferManager::complete_io`]. A chunk is acknowledged only once it is on disk.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chunk::{self, chunk_count, chunk_range, ChunkReceiveResult, ChunkSet, DEFAULT_CHUNK_SIZE};
use crate::event::{ErrorKind, ManagerAction, P2pEvent};
use crate::integrity::{self, PeerTrustTracker, DEFAULT_MAX_INTEGRITY_FAILURES};
use crate::message::SendOptions;
use crate::protocol::{kinds, PeerId};
use crate::scheduler::{self, InFlight};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: u64,
    pub max_concurrent_chunks: usize,
    /// A requested chunk not received within this long is requested again.
    pub chunk_timeout_ms: u64,
    pub max_chunk_retries: u32,
    /// Finished tasks stay queryable this long.
    pub retention_ms: u64,
    /// Persist task state through the journal so downloads survive a restart.
    pub enable_resume: bool,
    pub max_integrity_failures: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: 4,
            chunk_timeout_ms: 10_000,
            max_chunk_retries: 3,
            retention_ms: 60_000,
            enable_resume: true,
            max_integrity_failures: DEFAULT_MAX_INTEGRITY_FAILURES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// Hex SHA-256 of the whole file.
    pub file_hash: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Uploading,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    #[serde(rename = "type")]
    pub direction: TransferDirection,
    pub progress: f64,
    pub status: TransferStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),
    #[error("transfer {transfer_id} is {status:?}, cannot {operation}")]
    InvalidState {
        transfer_id: String,
        status: TransferStatus,
        operation: &'static str,
    },
    #[error("invalid transfer metadata: {0}")]
    InvalidMetadata(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("journal error: {0}")]
    Journal(#[from] bincode::Error),
    #[error("bad transfer payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Positioned file access for chunking. Hashing must stream. Shared with I/O jobs running on
/// other threads.
pub trait ChunkStore: Send + Sync {
    fn file_size(&self, path: &Path) -> io::Result<u64>;
    fn hash_file(&self, path: &Path) -> io::Result<String>;
    fn read_chunk(&self, path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>>;
    /// Create the destination (or keep an existing partial one) sized to `size` bytes.
    fn prepare(&self, path: &Path, size: u64) -> io::Result<()>;
    fn write_chunk(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()>;
}

/// Local filesystem. Files are opened per operation; nothing stays open between chunks.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsChunkStore;

impl ChunkStore for FsChunkStore {
    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn hash_file(&self, path: &Path) -> io::Result<String> {
        integrity::hash_file(path)
    }

    fn read_chunk(&self, path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn prepare(&self, path: &Path, size: u64) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.set_len(size)
    }

    fn write_chunk(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }
}

/// A unit of file work queued by [`TransferManager`]. Blocking; run it off the dispatch path.
pub struct IoJob {
    store: Arc<dyn ChunkStore>,
    transfer_id: String,
    op: IoOp,
}

#[derive(Debug)]
enum IoOp {
    HashSource {
        path: PathBuf,
    },
    /// `(index, offset, len)` per requested chunk.
    ReadChunks {
        path: PathBuf,
        ranges: Vec<(u32, u64, u64)>,
    },
    WriteChunk {
        path: PathBuf,
        index: u32,
        offset: u64,
        data: Vec<u8>,
    },
    VerifyFile {
        path: PathBuf,
    },
}

impl IoJob {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn run(self) -> IoOutcome {
        let store = self.store.as_ref();
        let result = match self.op {
            IoOp::HashSource { path } => IoResult::Hashed(store.hash_file(&path)),
            IoOp::ReadChunks { path, ranges } => {
                let mut chunks = Vec::with_capacity(ranges.len());
                for (index, offset, len) in ranges {
                    let read = usize::try_from(len)
                        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk too large"))
                        .and_then(|len| store.read_chunk(&path, offset, len))
                        .map(|data| {
                            let hash = integrity::hash_hex(&data);
                            (data, hash)
                        });
                    let failed = read.is_err();
                    chunks.push((index, read));
                    if failed {
                        break;
                    }
                }
                IoResult::ChunksRead(chunks)
            }
            IoOp::WriteChunk {
                path,
                index,
                offset,
                data,
            } => IoResult::ChunkWritten {
                index,
                len: data.len() as u64,
                result: store.write_chunk(&path, offset, &data),
            },
            IoOp::VerifyFile { path } => IoResult::Verified(store.hash_file(&path)),
        };
        IoOutcome {
            transfer_id: self.transfer_id,
            result,
        }
    }
}

impl fmt::Debug for IoJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match &self.op {
            IoOp::HashSource { .. } => "hash-source",
            IoOp::ReadChunks { .. } => "read-chunks",
            IoOp::WriteChunk { .. } => "write-chunk",
            IoOp::VerifyFile { .. } => "verify-file",
        };
        f.debug_struct("IoJob")
            .field("transfer_id", &self.transfer_id)
            .field("op", &op)
            .finish()
    }
}

/// Result of a finished [`IoJob`], to be passed to [`TransferManager::complete_io`].
#[derive(Debug)]
pub struct IoOutcome {
    transfer_id: String,
    result: IoResult,
}

impl IoOutcome {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }
}

#[derive(Debug)]
enum IoResult {
    Hashed(io::Result<String>),
    /// Chunk bytes with their hex hash; reading stops at the first error.
    ChunksRead(Vec<(u32, io::Result<(Vec<u8>, String)>)>),
    ChunkWritten {
        index: u32,
        len: u64,
        result: io::Result<()>,
    },
    Verified(io::Result<String>),
}

/// Durable task state for resuming across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub metadata: TransferMetadata,
    pub peer: PeerId,
    pub direction: TransferDirection,
    pub path: Option<PathBuf>,
    pub completed: Vec<u32>,
}

pub trait TransferJournal: Send {
    fn save(&mut self, snapshot: &TransferSnapshot) -> Result<(), TransferError>;
    fn remove(&mut self, transfer_id: &str) -> Result<(), TransferError>;
    fn load_all(&self) -> Result<Vec<TransferSnapshot>, TransferError>;
}

/// One `<transfer id>.resume` file (bincode) per task in a directory.
pub struct FileJournal {
    dir: PathBuf,
}

const JOURNAL_EXT: &str = "resume";

impl FileJournal {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, transfer_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", transfer_id, JOURNAL_EXT))
    }
}

impl TransferJournal for FileJournal {
    fn save(&mut self, snapshot: &TransferSnapshot) -> Result<(), TransferError> {
        let bytes = bincode::serialize(snapshot)?;
        let path = self.path_for(&snapshot.metadata.transfer_id);
        let tmp = path.with_extension("resume.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        match fs::remove_file(self.path_for(transfer_id)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            r => Ok(r?),
        }
    }

    fn load_all(&self) -> Result<Vec<TransferSnapshot>, TransferError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXT) {
                continue;
            }
            let bytes = fs::read(&path)?;
            match bincode::deserialize::<TransferSnapshot>(&bytes) {
                Ok(snapshot) => out.push(snapshot),
                Err(e) => warn!(path = %path.display(), "skipping unreadable journal entry: {}", e),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notice {
    transfer_id: String,
    #[serde(default)]
    reason: Option<String>,
}

impl Notice {
    fn new(transfer_id: &str) -> Self {
        Notice {
            transfer_id: transfer_id.to_string(),
            reason: None,
        }
    }

    fn because(transfer_id: &str, reason: &str) -> Self {
        Notice {
            transfer_id: transfer_id.to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRequest {
    transfer_id: String,
    indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkPayload {
    transfer_id: String,
    index: u32,
    /// Hex SHA-256 of the raw chunk bytes.
    hash: String,
    /// Base64 of the raw chunk bytes.
    data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkAck {
    transfer_id: String,
    index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub uploads_started: u64,
    pub downloads_started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub chunk_retries: u64,
    pub integrity_failures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One upload or download.
#[derive(Debug, Clone)]
pub struct TransferTask {
    metadata: TransferMetadata,
    peer: PeerId,
    direction: TransferDirection,
    status: TransferStatus,
    /// Source for uploads, destination for accepted downloads.
    path: Option<PathBuf>,
    chunks: ChunkSet,
    bytes_transferred: u64,
    in_flight: HashMap<u32, InFlight>,
    /// Verified chunks whose write job has not reported back yet.
    writing: HashSet<u32>,
    verifying: bool,
    finished_at: Option<u64>,
    failure: Option<String>,
}

impl TransferTask {
    fn new(
        metadata: TransferMetadata,
        peer: PeerId,
        direction: TransferDirection,
        path: Option<PathBuf>,
    ) -> Self {
        let chunks = ChunkSet::new(metadata.total_chunks);
        Self {
            metadata,
            peer,
            direction,
            status: TransferStatus::Pending,
            path,
            chunks,
            bytes_transferred: 0,
            in_flight: HashMap::new(),
            writing: HashSet::new(),
            verifying: false,
            finished_at: None,
            failure: None,
        }
    }

    fn restore(snapshot: TransferSnapshot) -> Self {
        let chunks = ChunkSet::from_completed(snapshot.metadata.total_chunks, snapshot.completed);
        let bytes_transferred = chunks
            .completed()
            .filter_map(|i| {
                chunk_range(i, snapshot.metadata.file_size, snapshot.metadata.chunk_size)
            })
            .map(|(s, e)| e - s)
            .sum();
        Self {
            chunks,
            bytes_transferred,
            ..Self::new(snapshot.metadata, snapshot.peer, snapshot.direction, snapshot.path)
        }
    }

    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            metadata: self.metadata.clone(),
            peer: self.peer.clone(),
            direction: self.direction,
            path: self.path.clone(),
            completed: self
                .chunks
                .completed()
                .filter(|i| !self.writing.contains(i))
                .collect(),
        }
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn chunks(&self) -> &ChunkSet {
        &self.chunks
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            direction: self.direction,
            progress: self.chunks.progress(),
            status: self.status,
        }
    }
}

/// Task owned by `peer` in the given direction (any direction when `None`).
fn task_for<'a>(
    tasks: &'a mut HashMap<String, TransferTask>,
    transfer_id: &str,
    peer: &PeerId,
    direction: Option<TransferDirection>,
) -> Option<&'a mut TransferTask> {
    tasks
        .get_mut(transfer_id)
        .filter(|t| &t.peer == peer && direction.map_or(true, |d| t.direction == d))
}

fn control(kind: &str) -> SendOptions {
    SendOptions::of_kind(kind).with_ack().immediate()
}

/// Transfer ids double as journal file names.
fn valid_transfer_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub struct TransferManager {
    config: TransferConfig,
    chunk_store: Arc<dyn ChunkStore>,
    journal: Option<Box<dyn TransferJournal>>,
    trust: PeerTrustTracker,
    now_ms: u64,
    tasks: HashMap<String, TransferTask>,
    actions: Vec<ManagerAction>,
    io_jobs: Vec<IoJob>,
    stats: TransferStats,
}

impl TransferManager {
    pub fn new(config: TransferConfig, chunk_store: Box<dyn ChunkStore>) -> Self {
        Self {
            config,
            chunk_store: Arc::from(chunk_store),
            journal: None,
            trust: PeerTrustTracker::new(),
            now_ms: 0,
            tasks: HashMap::new(),
            actions: Vec::new(),
            io_jobs: Vec::new(),
            stats: TransferStats::default(),
        }
    }

    pub fn with_journal(mut self, journal: Box<dyn TransferJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn get_task(&self, transfer_id: &str) -> Option<&TransferTask> {
        self.tasks.get(transfer_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TransferTask> {
        self.tasks.values()
    }

    pub fn active_transfers(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    pub fn is_isolated(&self, peer: &PeerId) -> bool {
        self.trust
            .is_isolated(peer, self.config.max_integrity_failures)
    }

    pub fn generate_transfer_id(&self) -> String {
        format!("transfer-{}-{}", self.now_ms, uuid::Uuid::new_v4().simple())
    }

    pub fn calculate_file_hash(&self, path: &Path) -> Result<String, TransferError> {
        Ok(self.chunk_store.hash_file(path)?)
    }

    /// `progress = completed / total`; `None` for unknown (or already discarded) transfers.
    pub fn get_progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        self.tasks.get(transfer_id).map(TransferTask::progress)
    }

    /// Offer `path` to `peer`. Returns the transfer id at once; the offer goes out when the
    /// queued source hash job completes, and chunks flow once the peer accepts.
    pub fn upload_file(&mut self, peer: &PeerId, path: &Path) -> Result<String, TransferError> {
        let file_size = self.chunk_store.file_size(path)?;
        let chunk_size = if self.config.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.config.chunk_size
        };
        let total_chunks = chunk_count(file_size, chunk_size).ok_or_else(|| {
            TransferError::InvalidMetadata(format!(
                "{} bytes in chunks of {} bytes exceeds {} chunks",
                file_size,
                chunk_size,
                u32::MAX
            ))
        })?;
        let transfer_id = self.generate_transfer_id();
        let metadata = TransferMetadata {
            transfer_id: transfer_id.clone(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_size,
            file_hash: String::new(),
            total_chunks,
            chunk_size,
        };
        debug!(peer = %peer, transfer = %transfer_id, size = file_size, "hashing file for offer");
        self.tasks.insert(
            transfer_id.clone(),
            TransferTask::new(
                metadata,
                peer.clone(),
                TransferDirection::Upload,
                Some(path.to_path_buf()),
            ),
        );
        self.stats.uploads_started += 1;
        self.queue_io(
            &transfer_id,
            IoOp::HashSource {
                path: path.to_path_buf(),
            },
        );
        Ok(transfer_id)
    }

    /// File work queued since the last call. Run each job (blocking) and pass the outcome to
    /// [`complete_io`](Self::complete_io).
    pub fn take_io_jobs(&mut self) -> Vec<IoJob> {
        std::mem::take(&mut self.io_jobs)
    }

    pub fn pending_io(&self) -> usize {
        self.io_jobs.len()
    }

    /// Apply a finished job. Outcomes for transfers that ended meanwhile are dropped.
    pub fn complete_io(&mut self, outcome: IoOutcome) -> Result<(), TransferError> {
        let IoOutcome {
            transfer_id: id,
            result,
        } = outcome;
        match result {
            IoResult::Hashed(hash) => self.on_source_hashed(&id, hash),
            IoResult::ChunksRead(chunks) => self.on_chunks_read(&id, chunks),
            IoResult::ChunkWritten { index, len, result } => {
                self.on_chunk_written(&id, index, len, result)
            }
            IoResult::Verified(hash) => self.on_verified(&id, hash),
        }
    }

    /// Run queued jobs on the calling thread until none are left. Returns how many ran.
    pub fn run_io(&mut self) -> usize {
        let mut ran = 0;
        loop {
            let jobs = self.take_io_jobs();
            if jobs.is_empty() {
                return ran;
            }
            for job in jobs {
                ran += 1;
                if let Err(e) = self.complete_io(job.run()) {
                    self.report(e);
                }
            }
        }
    }

    /// Register an offered download and ask the host to decide. Offers from isolated peers
    /// are rejected without asking.
    pub fn handle_transfer_request(
        &mut self,
        peer: &PeerId,
        metadata: TransferMetadata,
    ) -> Result<(), TransferError> {
        let id = metadata.transfer_id.clone();
        if self.is_isolated(peer) {
            warn!(peer = %peer, transfer = %id, "rejecting transfer from isolated peer");
            return self.send(
                peer,
                control(kinds::TRANSFER_REJECT),
                &Notice::because(&id, "peer isolated"),
            );
        }
        if !valid_transfer_id(&id) {
            return Err(TransferError::InvalidMetadata(format!(
                "bad transfer id {:?}",
                id
            )));
        }
        if metadata.chunk_size == 0
            || chunk_count(metadata.file_size, metadata.chunk_size) != Some(metadata.total_chunks)
        {
            return Err(TransferError::InvalidMetadata(format!(
                "{} chunks of {} bytes cannot hold {} bytes",
                metadata.total_chunks, metadata.chunk_size, metadata.file_size
            )));
        }
        if self.tasks.contains_key(&id) {
            debug!(peer = %peer, transfer = %id, "duplicate offer ignored");
            return Ok(());
        }
        info!(peer = %peer, transfer = %id, file = %metadata.file_name, "incoming transfer request");
        self.tasks.insert(
            id,
            TransferTask::new(
                metadata.clone(),
                peer.clone(),
                TransferDirection::Download,
                None,
            ),
        );
        self.emit(P2pEvent::TransferRequest {
            peer: peer.clone(),
            metadata,
        });
        Ok(())
    }

    /// Accept an offered download into `dest` and start pulling chunks.
    pub fn accept_transfer(&mut self, transfer_id: &str, dest: &Path) -> Result<(), TransferError> {
        let file_size = self.pending_offer(transfer_id, "accept")?.metadata.file_size;
        self.chunk_store.prepare(dest, file_size)?;
        let task = self.pending_offer(transfer_id, "accept")?;
        task.path = Some(dest.to_path_buf());
        task.status = TransferStatus::Downloading;
        let peer = task.peer.clone();
        self.stats.downloads_started += 1;
        self.send(
            &peer,
            control(kinds::TRANSFER_ACCEPT),
            &Notice::new(transfer_id),
        )?;
        self.persist(transfer_id);
        self.request_chunks(transfer_id)
    }

    pub fn reject_transfer(&mut self, transfer_id: &str, reason: &str) -> Result<(), TransferError> {
        let now = self.now_ms;
        let task = self.pending_offer(transfer_id, "reject")?;
        task.status = TransferStatus::Cancelled;
        task.finished_at = Some(now);
        let peer = task.peer.clone();
        self.send(
            &peer,
            control(kinds::TRANSFER_REJECT),
            &Notice::because(transfer_id, reason),
        )
    }

    /// Cancel from either side. Outstanding requests are dropped at once.
    pub fn cancel_transfer(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        let task = self
            .tasks
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(TransferError::InvalidState {
                transfer_id: transfer_id.to_string(),
                status: task.status,
                operation: "cancel",
            });
        }
        let peer = task.peer.clone();
        self.mark_cancelled(transfer_id);
        self.send(
            &peer,
            control(kinds::TRANSFER_CANCEL),
            &Notice::new(transfer_id),
        )
    }

    /// Continue an interrupted download, requesting only the chunks still missing.
    pub fn resume_transfer(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        let task = self
            .tasks
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        let resumable = task.direction == TransferDirection::Download
            && task.status == TransferStatus::Pending;
        let Some(dest) = task.path.clone().filter(|_| resumable) else {
            return Err(TransferError::InvalidState {
                transfer_id: transfer_id.to_string(),
                status: task.status,
                operation: "resume",
            });
        };
        self.chunk_store.prepare(&dest, task.metadata.file_size)?;
        task.status = TransferStatus::Downloading;
        task.in_flight.clear();
        let peer = task.peer.clone();
        info!(peer = %peer, transfer = %transfer_id, missing = task.chunks.missing().count(), "resuming download");
        self.send(
            &peer,
            control(kinds::TRANSFER_ACCEPT),
            &Notice::new(transfer_id),
        )?;
        self.request_chunks(transfer_id)
    }

    /// Reload journaled tasks after a restart. They come back as `Pending`; call
    /// [`resume_transfer`](Self::resume_transfer) once the peer is reachable again.
    pub fn restore_from_journal(&mut self) -> Result<usize, TransferError> {
        let Some(journal) = self.journal.as_ref() else {
            return Ok(0);
        };
        let mut restored = 0;
        for snapshot in journal.load_all()? {
            let id = snapshot.metadata.transfer_id.clone();
            if self.tasks.contains_key(&id) {
                continue;
            }
            self.tasks.insert(id, TransferTask::restore(snapshot));
            restored += 1;
        }
        Ok(restored)
    }

    /// The peer went away: running tasks pause as `Pending` with their completed chunks kept.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        for (id, task) in self.tasks.iter_mut() {
            if &task.peer == peer && !task.status.is_terminal() {
                task.status = TransferStatus::Pending;
                task.in_flight.clear();
                debug!(peer = %peer, transfer = %id, "transfer paused");
            }
        }
    }

    /// Handle a `transfer:` message from `peer`.
    pub fn handle_message(
        &mut self,
        peer: &PeerId,
        kind: &str,
        payload: Value,
    ) -> Result<(), TransferError> {
        match kind {
            kinds::TRANSFER_OFFER => {
                let metadata: TransferMetadata = serde_json::from_value(payload)?;
                self.handle_transfer_request(peer, metadata)
            }
            kinds::TRANSFER_ACCEPT => {
                let notice: Notice = serde_json::from_value(payload)?;
                self.on_accept(peer, &notice.transfer_id);
                Ok(())
            }
            kinds::TRANSFER_REJECT => {
                let notice: Notice = serde_json::from_value(payload)?;
                let reason = notice.reason.as_deref().unwrap_or("no reason given");
                self.on_remote_end(
                    peer,
                    &notice.transfer_id,
                    Some(TransferDirection::Upload),
                    Some(&format!("rejected by peer: {}", reason)),
                );
                Ok(())
            }
            kinds::TRANSFER_CHUNK_REQUEST => {
                let request: ChunkRequest = serde_json::from_value(payload)?;
                self.on_chunk_request(peer, request)
            }
            kinds::TRANSFER_CHUNK => {
                let chunk: ChunkPayload = serde_json::from_value(payload)?;
                self.on_chunk(peer, chunk)
            }
            kinds::TRANSFER_CHUNK_ACK => {
                let ack: ChunkAck = serde_json::from_value(payload)?;
                self.on_chunk_ack(peer, ack);
                Ok(())
            }
            kinds::TRANSFER_COMPLETE => {
                let notice: Notice = serde_json::from_value(payload)?;
                match notice.reason.as_deref() {
                    None => self.on_upload_completed(peer, &notice.transfer_id),
                    Some(reason) => self.on_remote_end(
                        peer,
                        &notice.transfer_id,
                        Some(TransferDirection::Upload),
                        Some(reason),
                    ),
                }
                Ok(())
            }
            kinds::TRANSFER_CANCEL => {
                let notice: Notice = serde_json::from_value(payload)?;
                self.on_remote_end(peer, &notice.transfer_id, None, None);
                Ok(())
            }
            other => {
                debug!(peer = %peer, kind = other, "ignoring unknown transfer message");
                Ok(())
            }
        }
    }

    fn on_accept(&mut self, peer: &PeerId, transfer_id: &str) {
        match task_for(&mut self.tasks, transfer_id, peer, Some(TransferDirection::Upload)) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TransferStatus::Uploading;
                debug!(peer = %peer, transfer = %transfer_id, "offer accepted");
            }
            _ => debug!(peer = %peer, transfer = %transfer_id, "accept for unknown upload"),
        }
    }

    fn on_chunk_request(&mut self, peer: &PeerId, request: ChunkRequest) -> Result<(), TransferError> {
        let id = request.transfer_id;
        let Some(task) = task_for(&mut self.tasks, &id, peer, Some(TransferDirection::Upload))
        else {
            debug!(peer = %peer, transfer = %id, "chunk request for unknown upload");
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }
        task.status = TransferStatus::Uploading;
        let (size, chunk_size) = (task.metadata.file_size, task.metadata.chunk_size);
        let Some(source) = task.path.clone() else {
            return Ok(());
        };
        let mut ranges = Vec::with_capacity(request.indices.len());
        for index in request.indices {
            match chunk_range(index, size, chunk_size) {
                Some((start, end)) => ranges.push((index, start, end - start)),
                None => warn!(peer = %peer, transfer = %id, index, "chunk request out of range"),
            }
        }
        if !ranges.is_empty() {
            self.queue_io(
                &id,
                IoOp::ReadChunks {
                    path: source,
                    ranges,
                },
            );
        }
        Ok(())
    }

    fn on_source_hashed(
        &mut self,
        transfer_id: &str,
        hash: io::Result<String>,
    ) -> Result<(), TransferError> {
        let Some(task) = self.tasks.get_mut(transfer_id) else {
            return Ok(());
        };
        if task.status.is_terminal() || !task.metadata.file_hash.is_empty() {
            return Ok(());
        }
        let file_hash = match hash {
            Ok(hash) => hash,
            // The peer never saw an offer.
            Err(e) => return self.fail(transfer_id, &format!("hashing file: {}", e), false),
        };
        task.metadata.file_hash = file_hash;
        let peer = task.peer.clone();
        let metadata = task.metadata.clone();
        self.send(&peer, control(kinds::TRANSFER_OFFER), &metadata)?;
        info!(peer = %peer, transfer = %transfer_id, size = metadata.file_size, "offering file");
        self.persist(transfer_id);
        Ok(())
    }

    fn on_chunks_read(
        &mut self,
        transfer_id: &str,
        chunks: Vec<(u32, io::Result<(Vec<u8>, String)>)>,
    ) -> Result<(), TransferError> {
        let Some(task) = self.tasks.get(transfer_id) else {
            return Ok(());
        };
        if task.status != TransferStatus::Uploading {
            debug!(transfer = %transfer_id, "dropping chunks read for inactive upload");
            return Ok(());
        }
        let peer = task.peer.clone();
        for (index, read) in chunks {
            let (data, hash) = match read {
                Ok(read) => read,
                Err(e) => {
                    return self.fail(transfer_id, &format!("reading chunk {}: {}", index, e), true)
                }
            };
            let body = ChunkPayload {
                transfer_id: transfer_id.to_string(),
                index,
                hash,
                data: BASE64.encode(&data),
            };
            self.stats.chunks_sent += 1;
            self.stats.bytes_sent += data.len() as u64;
            self.send(
                &peer,
                SendOptions::of_kind(kinds::TRANSFER_CHUNK)
                    .immediate()
                    .uncompressed(),
                &body,
            )?;
        }
        Ok(())
    }

    fn on_chunk(&mut self, peer: &PeerId, chunk: ChunkPayload) -> Result<(), TransferError> {
        let id = chunk.transfer_id;
        let index = chunk.index;
        let Some(task) = task_for(&mut self.tasks, &id, peer, Some(TransferDirection::Download))
        else {
            debug!(peer = %peer, transfer = %id, "chunk for unknown download");
            return Ok(());
        };
        if task.status != TransferStatus::Downloading {
            debug!(peer = %peer, transfer = %id, index, "chunk for inactive download dropped");
            return Ok(());
        }
        let (Some(data), Some(hash)) = (
            BASE64.decode(chunk.data.as_bytes()).ok(),
            integrity::parse_hash(&chunk.hash),
        ) else {
            return self.integrity_failure(peer, &id, index);
        };
        let (size, chunk_size) = (task.metadata.file_size, task.metadata.chunk_size);
        match chunk::on_chunk_data_received(&mut task.chunks, size, chunk_size, index, &hash, &data)
        {
            ChunkReceiveResult::Complete | ChunkReceiveResult::InProgress => {
                task.in_flight.remove(&index);
                let Some(dest) = task.path.clone() else {
                    return Ok(());
                };
                task.writing.insert(index);
                let offset = u64::from(index) * chunk_size;
                self.queue_io(
                    &id,
                    IoOp::WriteChunk {
                        path: dest,
                        index,
                        offset,
                        data,
                    },
                );
                Ok(())
            }
            // Acked when its write lands.
            ChunkReceiveResult::Duplicate if task.writing.contains(&index) => Ok(()),
            ChunkReceiveResult::Duplicate => self.send(
                peer,
                SendOptions::of_kind(kinds::TRANSFER_CHUNK_ACK),
                &ChunkAck {
                    transfer_id: id.clone(),
                    index,
                },
            ),
            ChunkReceiveResult::OutOfRange => {
                warn!(peer = %peer, transfer = %id, index, "chunk out of range dropped");
                Ok(())
            }
            ChunkReceiveResult::IntegrityFailed => self.integrity_failure(peer, &id, index),
        }
    }

    fn on_chunk_written(
        &mut self,
        transfer_id: &str,
        index: u32,
        len: u64,
        result: io::Result<()>,
    ) -> Result<(), TransferError> {
        let Some(task) = self.tasks.get_mut(transfer_id) else {
            return Ok(());
        };
        if !task.writing.remove(&index) || task.status.is_terminal() {
            return Ok(());
        }
        if let Err(e) = result {
            return self.fail(transfer_id, &format!("writing chunk {}: {}", index, e), true);
        }
        task.bytes_transferred += len;
        let progress = task.chunks.progress();
        let peer = task.peer.clone();
        let downloading = task.status == TransferStatus::Downloading;
        self.stats.chunks_received += 1;
        self.stats.bytes_received += len;
        self.persist(transfer_id);
        if !downloading {
            // Paused meanwhile; the chunk is kept and resume skips it.
            return Ok(());
        }
        self.send(
            &peer,
            SendOptions::of_kind(kinds::TRANSFER_CHUNK_ACK),
            &ChunkAck {
                transfer_id: transfer_id.to_string(),
                index,
            },
        )?;
        self.emit(P2pEvent::DownloadProgress {
            transfer_id: transfer_id.to_string(),
            progress,
        });
        self.request_chunks(transfer_id)
    }

    fn on_chunk_ack(&mut self, peer: &PeerId, ack: ChunkAck) {
        let Some(task) = task_for(&mut self.tasks, &ack.transfer_id, peer, Some(TransferDirection::Upload))
        else {
            return;
        };
        if task.status.is_terminal() || !task.chunks.insert(ack.index) {
            return;
        }
        if let Some((s, e)) = chunk_range(ack.index, task.metadata.file_size, task.metadata.chunk_size) {
            task.bytes_transferred += e - s;
        }
        let progress = task.chunks.progress();
        self.emit(P2pEvent::UploadProgress {
            transfer_id: ack.transfer_id,
            progress,
        });
    }

    fn on_upload_completed(&mut self, peer: &PeerId, transfer_id: &str) {
        match task_for(&mut self.tasks, transfer_id, peer, Some(TransferDirection::Upload)) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TransferStatus::Completed;
                task.finished_at = Some(self.now_ms);
            }
            _ => return,
        }
        self.stats.completed += 1;
        self.forget(transfer_id);
        info!(peer = %peer, transfer = %transfer_id, "upload completed");
        self.emit(P2pEvent::TransferCompleted {
            transfer_id: transfer_id.to_string(),
        });
    }

    /// The peer ended the transfer: failed with `reason`, or cancelled when `None`.
    fn on_remote_end(
        &mut self,
        peer: &PeerId,
        transfer_id: &str,
        direction: Option<TransferDirection>,
        reason: Option<&str>,
    ) {
        let live = task_for(&mut self.tasks, transfer_id, peer, direction)
            .is_some_and(|t| !t.status.is_terminal());
        if !live {
            return;
        }
        match reason {
            Some(reason) => {
                // Nothing to report back; the peer already knows.
                let _ = self.fail(transfer_id, reason, false);
            }
            None => self.mark_cancelled(transfer_id),
        }
    }

    fn pending_offer(
        &mut self,
        transfer_id: &str,
        operation: &'static str,
    ) -> Result<&mut TransferTask, TransferError> {
        let task = self
            .tasks
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if task.direction != TransferDirection::Download
            || task.status != TransferStatus::Pending
            || task.path.is_some()
        {
            return Err(TransferError::InvalidState {
                transfer_id: transfer_id.to_string(),
                status: task.status,
                operation,
            });
        }
        Ok(task)
    }

    fn request_chunks(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        let Some(task) = self.tasks.get_mut(transfer_id) else {
            return Ok(());
        };
        if task.status != TransferStatus::Downloading {
            return Ok(());
        }
        if task.chunks.is_complete() {
            if !task.writing.is_empty() {
                return Ok(());
            }
            return self.finish_download(transfer_id);
        }
        let indices =
            scheduler::next_requests(&task.chunks, &task.in_flight, self.config.max_concurrent_chunks);
        if indices.is_empty() {
            return Ok(());
        }
        for &index in &indices {
            task.in_flight.insert(
                index,
                InFlight {
                    issued_at: self.now_ms,
                    attempts: 1,
                },
            );
        }
        let peer = task.peer.clone();
        self.send(
            &peer,
            SendOptions::of_kind(kinds::TRANSFER_CHUNK_REQUEST).immediate(),
            &ChunkRequest {
                transfer_id: transfer_id.to_string(),
                indices,
            },
        )
    }

    /// All chunks are on disk: queue the whole-file check before calling it done.
    fn finish_download(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        let Some(task) = self.tasks.get_mut(transfer_id) else {
            return Ok(());
        };
        let Some(dest) = task.path.clone() else {
            return Ok(());
        };
        if task.verifying {
            return Ok(());
        }
        task.verifying = true;
        self.queue_io(transfer_id, IoOp::VerifyFile { path: dest });
        Ok(())
    }

    fn on_verified(&mut self, transfer_id: &str, hash: io::Result<String>) -> Result<(), TransferError> {
        let Some(task) = self.tasks.get_mut(transfer_id) else {
            return Ok(());
        };
        task.verifying = false;
        // Paused or ended meanwhile; a resumed download verifies again.
        if task.status != TransferStatus::Downloading {
            return Ok(());
        }
        let expected = task.metadata.file_hash.clone();
        let peer = task.peer.clone();
        match hash {
            Ok(actual) if actual == expected => {}
            Ok(_) => {
                warn!(peer = %peer, transfer = %transfer_id, "reassembled file hash mismatch");
                return self.fail(transfer_id, "file hash mismatch", true);
            }
            Err(e) => return self.fail(transfer_id, &format!("verifying file: {}", e), true),
        }
        if let Some(task) = self.tasks.get_mut(transfer_id) {
            task.status = TransferStatus::Completed;
            task.finished_at = Some(self.now_ms);
            task.in_flight.clear();
        }
        self.stats.completed += 1;
        self.forget(transfer_id);
        info!(peer = %peer, transfer = %transfer_id, "download completed");
        self.emit(P2pEvent::TransferCompleted {
            transfer_id: transfer_id.to_string(),
        });
        self.send(
            &peer,
            control(kinds::TRANSFER_COMPLETE),
            &Notice::new(transfer_id),
        )
    }

    fn integrity_failure(
        &mut self,
        peer: &PeerId,
        transfer_id: &str,
        index: u32,
    ) -> Result<(), TransferError> {
        self.trust.record_failure(peer);
        self.stats.integrity_failures += 1;
        let failures = self.trust.failure_count(peer);
        warn!(peer = %peer, transfer = %transfer_id, index, failures, "chunk failed integrity check");
        self.emit(P2pEvent::Error {
            kind: ErrorKind::Integrity,
            message: format!("chunk {} of {} from {} failed verification", index, transfer_id, peer),
        });
        self.fail(
            transfer_id,
            &format!("chunk {} failed integrity check", index),
            true,
        )
    }

    /// Move a live task to `Failed`; `notify` tells the peer through `transfer:complete`.
    fn fail(&mut self, transfer_id: &str, reason: &str, notify: bool) -> Result<(), TransferError> {
        let Some(task) = self.tasks.get_mut(transfer_id) else {
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }
        task.status = TransferStatus::Failed;
        task.finished_at = Some(self.now_ms);
        task.failure = Some(reason.to_string());
        task.in_flight.clear();
        let peer = task.peer.clone();
        self.stats.failed += 1;
        self.forget(transfer_id);
        warn!(peer = %peer, transfer = %transfer_id, reason, "transfer failed");
        self.emit(P2pEvent::TransferFailed {
            transfer_id: transfer_id.to_string(),
            reason: reason.to_string(),
        });
        if notify {
            self.send(
                &peer,
                control(kinds::TRANSFER_COMPLETE),
                &Notice::because(transfer_id, reason),
            )?;
        }
        Ok(())
    }

    fn mark_cancelled(&mut self, transfer_id: &str) {
        let Some(task) = self.tasks.get_mut(transfer_id) else {
            return;
        };
        task.status = TransferStatus::Cancelled;
        task.finished_at = Some(self.now_ms);
        task.in_flight.clear();
        self.stats.cancelled += 1;
        self.forget(transfer_id);
        info!(transfer = %transfer_id, "transfer cancelled");
        self.emit(P2pEvent::TransferCancelled {
            transfer_id: transfer_id.to_string(),
        });
    }

    /// Advance time: re-request timed-out chunks (failing after `max_chunk_retries`) and
    /// discard finished tasks past retention.
    pub fn tick(&mut self, now_ms: u64) -> Vec<ManagerAction> {
        self.now_ms = now_ms;
        let (timeout, max_retries) = (self.config.chunk_timeout_ms, self.config.max_chunk_retries);

        let mut exhausted = Vec::new();
        let mut rerequests = Vec::new();
        for (id, task) in self.tasks.iter_mut() {
            if task.status != TransferStatus::Downloading {
                continue;
            }
            let mut again = Vec::new();
            for index in scheduler::timed_out(&task.in_flight, now_ms, timeout) {
                let Some(flight) = task.in_flight.get_mut(&index) else {
                    continue;
                };
                if flight.attempts > max_retries {
                    exhausted.push((id.clone(), index));
                    break;
                }
                flight.attempts += 1;
                flight.issued_at = now_ms;
                again.push(index);
            }
            if !again.is_empty() {
                rerequests.push((task.peer.clone(), id.clone(), again));
            }
        }
        for (peer, id, indices) in rerequests {
            if exhausted.iter().any(|(e, _)| *e == id) {
                continue;
            }
            self.stats.chunk_retries += indices.len() as u64;
            debug!(peer = %peer, transfer = %id, ?indices, "re-requesting timed out chunks");
            let sent = self.send(
                &peer,
                SendOptions::of_kind(kinds::TRANSFER_CHUNK_REQUEST).immediate(),
                &ChunkRequest {
                    transfer_id: id,
                    indices,
                },
            );
            if let Err(e) = sent {
                self.report(e);
            }
        }
        for (id, index) in exhausted {
            let reason = format!("chunk {} timed out", index);
            if let Err(e) = self.fail(&id, &reason, true) {
                self.report(e);
            }
        }

        let retention = self.config.retention_ms;
        self.tasks.retain(|_, t| {
            t.finished_at
                .map_or(true, |at| now_ms.saturating_sub(at) < retention)
        });

        self.drain_actions()
    }

    pub fn drain_actions(&mut self) -> Vec<ManagerAction> {
        std::mem::take(&mut self.actions)
    }

    /// Drop all outstanding requests; running tasks pause as `Pending` so they can resume.
    pub fn stop(&mut self) {
        for task in self.tasks.values_mut() {
            task.in_flight.clear();
            if !task.status.is_terminal() {
                task.status = TransferStatus::Pending;
            }
        }
    }

    fn send<T: Serialize>(
        &mut self,
        peer: &PeerId,
        options: SendOptions,
        body: &T,
    ) -> Result<(), TransferError> {
        let payload = serde_json::to_value(body)?;
        self.actions.push(ManagerAction::Send {
            peer: peer.clone(),
            options,
            payload,
        });
        Ok(())
    }

    fn emit(&mut self, event: P2pEvent) {
        self.actions.push(ManagerAction::Emit(event));
    }

    fn queue_io(&mut self, transfer_id: &str, op: IoOp) {
        self.io_jobs.push(IoJob {
            store: Arc::clone(&self.chunk_store),
            transfer_id: transfer_id.to_string(),
            op,
        });
    }

    fn report(&mut self, e: TransferError) {
        warn!("transfer error: {}", e);
        self.emit(P2pEvent::Error {
            kind: ErrorKind::Transfer,
            message: e.to_string(),
        });
    }

    fn persist(&mut self, transfer_id: &str) {
        if !self.config.enable_resume {
            return;
        }
        let (Some(journal), Some(task)) = (self.journal.as_mut(), self.tasks.get(transfer_id))
        else {
            return;
        };
        if let Err(e) = journal.save(&task.snapshot()) {
            warn!(transfer = %transfer_id, "journal save failed: {}", e);
        }
    }

    fn forget(&mut self, transfer_id: &str) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if let Err(e) = journal.remove(transfer_id) {
            warn!(transfer = %transfer_id, "journal remove failed: {}", e);
        }
    }
}
