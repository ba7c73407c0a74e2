//! Chunk bookkeeping: split a file into fixed-size chunks, track which indices are done.

use std::collections::BTreeSet;

use crate::integrity;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024; // 64 KiB

/// Number of chunks for a file: `ceil(file_size / chunk_size)`. A zero chunk size uses the default.
/// `None` when the count does not fit a `u32` chunk index.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> Option<u32> {
    let size = effective_chunk_size(chunk_size);
    u32::try_from(file_size.div_ceil(size)).ok()
}

/// Byte range `[start, end)` of chunk `index`, or `None` when the index is past the end.
pub fn chunk_range(index: u32, file_size: u64, chunk_size: u64) -> Option<(u64, u64)> {
    let size = effective_chunk_size(chunk_size);
    let start = u64::from(index).checked_mul(size)?;
    if start >= file_size {
        return None;
    }
    Some((start, (start + size).min(file_size)))
}

fn effective_chunk_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Completed chunk indices of one transfer. Always a subset of `[0, total)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSet {
    total: u32,
    completed: BTreeSet<u32>,
}

impl ChunkSet {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            completed: BTreeSet::new(),
        }
    }

    /// Rebuild from persisted indices; anything out of range is dropped.
    pub fn from_completed(total: u32, completed: impl IntoIterator<Item = u32>) -> Self {
        Self {
            total,
            completed: completed.into_iter().filter(|&i| i < total).collect(),
        }
    }

    /// Mark a chunk done. Returns true if the index was in range and not already present.
    pub fn insert(&mut self, index: u32) -> bool {
        index < self.total && self.completed.insert(index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.completed.contains(&index)
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn completed_count(&self) -> u32 {
        self.completed.len() as u32
    }

    pub fn completed(&self) -> impl Iterator<Item = u32> + '_ {
        self.completed.iter().copied()
    }

    /// Indices still missing, in ascending order.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total).filter(move |i| !self.completed.contains(i))
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() as u32 == self.total
    }

    /// Fraction done in `[0, 1]`. An empty transfer counts as done.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        f64::from(self.completed_count()) / f64::from(self.total)
    }
}

/// Result of checking received chunk data against its advertised hash and the transfer layout.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Chunk accepted; transfer now has every chunk.
    Complete,
    /// Chunk accepted; more chunks outstanding.
    InProgress,
    /// Chunk was already recorded; nothing changed.
    Duplicate,
    /// Index outside the transfer or payload length does not match the chunk range.
    OutOfRange,
    /// Integrity check failed.
    IntegrityFailed,
}

/// Verify a received chunk (range, length, hash) and record it in `chunks`.
/// The caller persists the payload only when the result is `Complete` or `InProgress`.
pub fn on_chunk_data_received(
    chunks: &mut ChunkSet,
    file_size: u64,
    chunk_size: u64,
    index: u32,
    hash: &[u8; 32],
    payload: &[u8],
) -> ChunkReceiveResult {
    let Some((start, end)) = chunk_range(index, file_size, chunk_size) else {
        return ChunkReceiveResult::OutOfRange;
    };
    if index >= chunks.total() || payload.len() as u64 != end - start {
        return ChunkReceiveResult::OutOfRange;
    }
    if !integrity::verify_chunk(payload, hash) {
        return ChunkReceiveResult::IntegrityFailed;
    }
    if !chunks.insert(index) {
        return ChunkReceiveResult::Duplicate;
    }
    if chunks.is_complete() {
        ChunkReceiveResult::Complete
    } else {
        ChunkReceiveResult::InProgress
    }
}
