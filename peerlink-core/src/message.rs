//! Message manager: per-peer batching, optional payload compression, duplicate suppression
//! and acknowledgement-based retry.
//!
//! Host-driven like the rest of the core: time advances only through [`MessageManager::tick`],
//! and outbound work is returned as [`MessageAction`]s for the caller to put on the wire.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{kinds, Message, MessageId, PeerId};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Flush a peer's batch once it holds this many messages.
    pub batch_size: usize,
    /// Flush a non-empty batch this long after its first message was enqueued.
    pub batch_interval_ms: u64,
    /// Serialized payloads above this many bytes are compressed (when requested).
    pub compression_threshold: usize,
    pub ack_timeout_ms: u64,
    /// Resends after the first attempt before giving up.
    pub max_retries: u32,
    /// Base backoff added to the ack timeout; doubles per retry.
    pub retry_backoff_ms: u64,
    /// How long a received message id is remembered for duplicate detection.
    pub seen_window_ms: u64,
    /// Per-peer cap on remembered ids; oldest are forgotten first.
    pub seen_capacity: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval_ms: 100,
            compression_threshold: 1024,
            ack_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 1_000,
            seen_window_ms: 5 * 60 * 1_000,
            seen_capacity: 10_000,
        }
    }
}

/// Per-send options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub kind: String,
    pub compress: bool,
    pub require_ack: bool,
    /// Skip batching: flush what is queued for the peer, then send this message on its own.
    pub immediate: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            kind: kinds::MESSAGE.to_string(),
            compress: true,
            require_ack: false,
            immediate: false,
        }
    }
}

impl SendOptions {
    pub fn of_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    pub fn with_ack(mut self) -> Self {
        self.require_ack = true;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn uncompressed(mut self) -> Self {
        self.compress = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageStats {
    pub sent: u64,
    pub received: u64,
    pub duplicates: u64,
    pub compressed: u64,
    pub bytes_before_compression: u64,
    pub bytes_after_compression: u64,
    pub batches_flushed: u64,
    pub acked: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Work for the host: frames to put on the raw channel, or terminal delivery failures.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageAction {
    /// One batch for one peer, messages in enqueue order.
    SendBatch {
        peer: PeerId,
        messages: Vec<Message>,
    },
    SendAck {
        peer: PeerId,
        message_ids: Vec<MessageId>,
    },
    /// Retries exhausted without an acknowledgement.
    DeliveryFailed {
        peer: PeerId,
        message_id: MessageId,
        attempts: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("payload encode error: {0}")]
    Encode(serde_json::Error),
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("compressed payload is not valid base64")]
    MalformedCompressed,
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
    #[error("payload decode error: {0}")]
    Decode(serde_json::Error),
}

/// Compress a payload when its JSON form exceeds `threshold` bytes and compression actually
/// shrinks it. Returns `(encoded, original_len)` or `None` to send it as is.
pub fn compress_payload(
    payload: &Value,
    threshold: usize,
) -> Result<Option<(String, usize)>, MessageError> {
    let raw = serde_json::to_vec(payload).map_err(MessageError::Encode)?;
    if raw.len() <= threshold {
        return Ok(None);
    }
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).map_err(MessageError::Compress)?;
    let packed = encoder.finish().map_err(MessageError::Compress)?;
    let encoded = BASE64.encode(packed);
    if encoded.len() >= raw.len() {
        return Ok(None);
    }
    Ok(Some((encoded, raw.len())))
}

/// Reverse of [`compress_payload`].
pub fn decompress_payload(payload: &Value) -> Result<Value, MessageError> {
    let Value::String(encoded) = payload else {
        return Err(MessageError::MalformedCompressed);
    };
    let packed = BASE64
        .decode(encoded)
        .map_err(|_| MessageError::MalformedCompressed)?;
    let mut raw = Vec::new();
    DeflateDecoder::new(packed.as_slice())
        .read_to_end(&mut raw)
        .map_err(MessageError::Decompress)?;
    serde_json::from_slice(&raw).map_err(MessageError::Decode)
}

/// Recently seen message ids for one peer, bounded by age and count.
#[derive(Default)]
struct SeenCache {
    order: VecDeque<(MessageId, u64)>,
    ids: HashSet<MessageId>,
}

impl SeenCache {
    fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: MessageId, now_ms: u64) {
        if self.ids.insert(id.clone()) {
            self.order.push_back((id, now_ms));
        }
    }

    fn evict(&mut self, now_ms: u64, window_ms: u64, capacity: usize) {
        while let Some((_, seen_at)) = self.order.front() {
            if now_ms.saturating_sub(*seen_at) <= window_ms && self.order.len() <= capacity {
                break;
            }
            if let Some((id, _)) = self.order.pop_front() {
                self.ids.remove(&id);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Outbox {
    batch: Vec<Message>,
    opened_at: u64,
}

struct PendingAck {
    peer: PeerId,
    message: Message,
    /// Sends so far, including the first.
    attempts: u32,
    deadline: u64,
}

pub struct MessageManager {
    config: MessageConfig,
    now_ms: u64,
    outboxes: HashMap<PeerId, Outbox>,
    pending: HashMap<MessageId, PendingAck>,
    seen: HashMap<PeerId, SeenCache>,
    actions: Vec<MessageAction>,
    stats: MessageStats,
}

impl MessageManager {
    pub fn new(config: MessageConfig) -> Self {
        Self {
            config,
            now_ms: 0,
            outboxes: HashMap::new(),
            pending: HashMap::new(),
            seen: HashMap::new(),
            actions: Vec::new(),
            stats: MessageStats::default(),
        }
    }

    pub fn config(&self) -> &MessageConfig {
        &self.config
    }

    pub fn stats(&self) -> &MessageStats {
        &self.stats
    }

    pub fn generate_message_id(&self) -> MessageId {
        MessageId::generate()
    }

    /// Enqueue a message for `peer`. Returns its id; the frame itself comes out of `tick`/`drain_actions`.
    pub fn send_message(
        &mut self,
        peer: &PeerId,
        payload: Value,
        options: SendOptions,
    ) -> Result<MessageId, MessageError> {
        let (payload, compressed) = if options.compress {
            match compress_payload(&payload, self.config.compression_threshold)? {
                Some((encoded, original_len)) => {
                    self.stats.compressed += 1;
                    self.stats.bytes_before_compression += original_len as u64;
                    self.stats.bytes_after_compression += encoded.len() as u64;
                    (Value::String(encoded), true)
                }
                None => (payload, false),
            }
        } else {
            (payload, false)
        };
        let id = self.generate_message_id();
        let message = Message {
            id: id.clone(),
            kind: options.kind,
            payload,
            timestamp: self.now_ms,
            compressed,
            require_ack: options.require_ack,
        };
        self.stats.sent += 1;

        if options.immediate {
            self.flush_peer(peer);
            self.emit_batch(peer.clone(), vec![message]);
            return Ok(id);
        }
        let now = self.now_ms;
        let outbox = self.outboxes.entry(peer.clone()).or_insert_with(|| Outbox {
            batch: Vec::new(),
            opened_at: now,
        });
        if outbox.batch.is_empty() {
            outbox.opened_at = now;
        }
        outbox.batch.push(message);
        if outbox.batch.len() >= self.config.batch_size.max(1) {
            self.flush_peer(peer);
        }
        Ok(id)
    }

    /// Duplicate check and payload decoding for one inbound message.
    /// `Ok(None)` means the id was already delivered from this peer.
    pub fn receive_message(
        &mut self,
        peer: &PeerId,
        message: Message,
    ) -> Result<Option<Message>, MessageError> {
        let cache = self.seen.entry(peer.clone()).or_default();
        if cache.contains(&message.id) {
            self.stats.duplicates += 1;
            debug!(peer = %peer, id = %message.id, "duplicate message dropped");
            return Ok(None);
        }
        let message = if message.compressed {
            Message {
                payload: decompress_payload(&message.payload)?,
                compressed: false,
                ..message
            }
        } else {
            message
        };
        cache.insert(message.id.clone(), self.now_ms);
        self.stats.received += 1;
        Ok(Some(message))
    }

    /// Process an inbound batch: acknowledge ack-requiring messages (duplicates included, so a
    /// sender whose ack got lost stops retrying) and return the novel ones in order.
    pub fn handle_batch(&mut self, peer: &PeerId, messages: Vec<Message>) -> Vec<Message> {
        let mut acks = Vec::new();
        let mut delivered = Vec::with_capacity(messages.len());
        for message in messages {
            let needs_ack = message.require_ack;
            let id = message.id.clone();
            match self.receive_message(peer, message) {
                Ok(Some(m)) => {
                    delivered.push(m);
                    if needs_ack {
                        acks.push(id);
                    }
                }
                Ok(None) => {
                    if needs_ack {
                        acks.push(id);
                    }
                }
                Err(e) => warn!(peer = %peer, id = %id, "dropping undecodable message: {}", e),
            }
        }
        if !acks.is_empty() {
            self.actions.push(MessageAction::SendAck {
                peer: peer.clone(),
                message_ids: acks,
            });
        }
        delivered
    }

    /// Acknowledgements from `peer`. Stops retries immediately, even mid-backoff.
    pub fn on_ack(&mut self, peer: &PeerId, message_ids: &[MessageId]) {
        for id in message_ids {
            if self.pending.get(id).is_some_and(|p| &p.peer == peer) {
                self.pending.remove(id);
                self.stats.acked += 1;
            }
        }
    }

    /// Advance time: flush batches whose interval elapsed, resend or fail unacknowledged
    /// messages, expire old seen ids. Returns all pending actions.
    pub fn tick(&mut self, now_ms: u64) -> Vec<MessageAction> {
        self.now_ms = now_ms;

        let interval = self.config.batch_interval_ms;
        let due: Vec<PeerId> = self
            .outboxes
            .iter()
            .filter(|(_, o)| !o.batch.is_empty() && now_ms.saturating_sub(o.opened_at) >= interval)
            .map(|(p, _)| p.clone())
            .collect();
        for peer in due {
            self.flush_peer(&peer);
        }

        let expired: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| now_ms >= p.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.retry_or_fail(&id);
        }

        let (window, capacity) = (self.config.seen_window_ms, self.config.seen_capacity);
        for cache in self.seen.values_mut() {
            cache.evict(now_ms, window, capacity);
        }
        self.seen.retain(|_, c| c.len() > 0);

        self.drain_actions()
    }

    pub fn drain_actions(&mut self) -> Vec<MessageAction> {
        std::mem::take(&mut self.actions)
    }

    /// Flush every queued batch and cancel all outstanding retries.
    pub fn stop(&mut self) {
        let peers: Vec<PeerId> = self.outboxes.keys().cloned().collect();
        for peer in peers {
            self.flush_peer(&peer);
        }
        self.outboxes.clear();
        self.pending.clear();
    }

    /// Messages queued for `peer` and not yet flushed.
    pub fn queued(&self, peer: &PeerId) -> usize {
        self.outboxes.get(peer).map_or(0, |o| o.batch.len())
    }

    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    fn flush_peer(&mut self, peer: &PeerId) {
        let batch = match self.outboxes.get_mut(peer) {
            Some(o) if !o.batch.is_empty() => std::mem::take(&mut o.batch),
            _ => return,
        };
        self.emit_batch(peer.clone(), batch);
    }

    fn emit_batch(&mut self, peer: PeerId, messages: Vec<Message>) {
        let deadline = self.now_ms + self.config.ack_timeout_ms;
        for m in messages.iter().filter(|m| m.require_ack) {
            self.pending.insert(
                m.id.clone(),
                PendingAck {
                    peer: peer.clone(),
                    message: m.clone(),
                    attempts: 1,
                    deadline,
                },
            );
        }
        self.stats.batches_flushed += 1;
        self.actions.push(MessageAction::SendBatch { peer, messages });
    }

    fn retry_or_fail(&mut self, id: &MessageId) {
        let Some(entry) = self.pending.get_mut(id) else {
            return;
        };
        if entry.attempts > self.config.max_retries {
            let attempts = entry.attempts;
            if let Some(entry) = self.pending.remove(id) {
                self.stats.failed += 1;
                warn!(peer = %entry.peer, id = %id, attempts, "message delivery failed");
                self.actions.push(MessageAction::DeliveryFailed {
                    peer: entry.peer,
                    message_id: id.clone(),
                    attempts,
                });
            }
            return;
        }
        let retry = entry.attempts;
        entry.attempts += 1;
        let backoff = self
            .config
            .retry_backoff_ms
            .saturating_mul(1u64 << (retry - 1).min(16));
        entry.deadline = self.now_ms + self.config.ack_timeout_ms + backoff;
        self.stats.retried += 1;
        debug!(peer = %entry.peer, id = %id, retry, "resending unacknowledged message");
        let action = MessageAction::SendBatch {
            peer: entry.peer.clone(),
            messages: vec![entry.message.clone()],
        };
        self.actions.push(action);
    }
}
