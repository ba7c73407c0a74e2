//! Integrity: SHA-256 chunk and whole-file digests, verify on receive, peer trust tracking.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::protocol::PeerId;

/// Default maximum integrity failures before a peer is isolated.
pub const DEFAULT_MAX_INTEGRITY_FAILURES: u32 = 3;

/// Read size used when streaming a file through the hasher.
pub const HASH_READ_SIZE: usize = 64 * 1024;

/// Hash a chunk payload. Returns 32-byte digest.
pub fn hash_chunk(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify chunk payload against expected hash.
pub fn verify_chunk(payload: &[u8], expected_hash: &[u8; 32]) -> bool {
    hash_chunk(payload) == *expected_hash
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn hash_hex(payload: &[u8]) -> String {
    hex::encode(hash_chunk(payload))
}

/// Parse a hex digest back into bytes. `None` if it is not 32 hex-encoded bytes.
pub fn parse_hash(hex_digest: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_digest).ok()?;
    bytes.try_into().ok()
}

/// Whole-stream digest, fed in fixed-size reads so the input is never held in memory at once.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_READ_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whole-file digest (hex SHA-256), streamed.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = std::fs::File::open(path)?;
    hash_reader(file)
}

/// Tracks integrity failures per peer for malicious peer detection.
pub struct PeerTrustTracker {
    failures: HashMap<PeerId, u32>,
}

impl PeerTrustTracker {
    pub fn new() -> Self {
        Self {
            failures: HashMap::new(),
        }
    }

    /// Record an integrity failure for a peer.
    pub fn record_failure(&mut self, peer_id: &PeerId) {
        *self.failures.entry(peer_id.clone()).or_insert(0) += 1;
    }

    /// Check if a peer should be isolated (failures >= max_failures).
    pub fn is_isolated(&self, peer_id: &PeerId, max_failures: u32) -> bool {
        self.failure_count(peer_id) >= max_failures
    }

    pub fn failure_count(&self, peer_id: &PeerId) -> u32 {
        self.failures.get(peer_id).copied().unwrap_or(0)
    }
}

impl Default for PeerTrustTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_verify() {
        let payload = b"hello chunk";
        let hash = hash_chunk(payload);
        assert!(verify_chunk(payload, &hash));
        assert!(!verify_chunk(b"tampered", &hash));
    }

    #[test]
    fn hex_digest_parses_back() {
        let digest = hash_hex(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(parse_hash(&digest), Some(hash_chunk(b"abc")));
        assert_eq!(parse_hash("zz"), None);
        assert_eq!(parse_hash("abcd"), None);
    }

    #[test]
    fn file_hash_matches_in_memory_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // Larger than one read so the streaming loop runs more than once.
        let data: Vec<u8> = (0..(HASH_READ_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        assert_eq!(hash_file(file.path()).unwrap(), hash_hex(&data));
    }

    #[test]
    fn peer_isolated_after_threshold() {
        let mut tracker = PeerTrustTracker::new();
        let peer = PeerId::from("mallory");
        for _ in 0..DEFAULT_MAX_INTEGRITY_FAILURES - 1 {
            tracker.record_failure(&peer);
        }
        assert!(!tracker.is_isolated(&peer, DEFAULT_MAX_INTEGRITY_FAILURES));
        tracker.record_failure(&peer);
        assert_eq!(tracker.failure_count(&peer), DEFAULT_MAX_INTEGRITY_FAILURES);
        assert!(tracker.is_isolated(&peer, DEFAULT_MAX_INTEGRITY_FAILURES));
        assert!(!tracker.is_isolated(&PeerId::from("alice"), DEFAULT_MAX_INTEGRITY_FAILURES));
    }
}
