//! Enhanced manager: wires the message, sync and transfer managers to one peer channel and
//! exposes a single event and statistics surface to the host.
//!
//! Host-driven like the managers it owns: the host feeds inbound bytes through `on_receive`,
//! calls `tick` with its clock, and listens on `subscribe`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::PeerChannel;
use crate::event::{ErrorKind, ManagerAction, P2pEvent};
use crate::message::{MessageAction, MessageConfig, MessageError, MessageManager, MessageStats, SendOptions};
use crate::protocol::{kinds, Frame, MessageId, PeerId};
use crate::seal::{FrameCipher, SealError};
use crate::sync::{ChangeStore, SyncConfig, SyncError, SyncManager, SyncStats};
use crate::transfer::{
    ChunkStore, IoJob, IoOutcome, TransferConfig, TransferError, TransferJournal, TransferManager,
    TransferProgress, TransferStats,
};
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnhancedConfig {
    pub messages: MessageConfig,
    pub sync: SyncConfig,
    pub transfer: TransferConfig,
    /// Events buffered per subscriber before slow receivers start lagging.
    pub event_capacity: usize,
}

impl Default for EnhancedConfig {
    fn default() -> Self {
        Self {
            messages: MessageConfig::default(),
            sync: SyncConfig::default(),
            transfer: TransferConfig::default(),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnhancedError {
    #[error("manager is not running")]
    NotRunning,
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("cannot open frame: {0}")]
    Seal(#[from] SealError),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
}

/// A delivered message as the router sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub peer_id: PeerId,
    pub message_id: MessageId,
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedStats {
    pub is_running: bool,
    pub uptime_ms: u64,
    pub connected_peers: usize,
    pub total_messages: u64,
    pub total_syncs: u64,
    pub total_file_transfers: u64,
    pub errors: u64,
    pub messages: MessageStats,
    pub sync: SyncStats,
    pub transfer: TransferStats,
}

pub struct EnhancedManager {
    channel: Box<dyn PeerChannel>,
    cipher: Option<Box<dyn FrameCipher>>,
    messages: MessageManager,
    sync: SyncManager,
    transfers: TransferManager,
    events: broadcast::Sender<P2pEvent>,
    peers: BTreeSet<PeerId>,
    running: bool,
    started_at: u64,
    now_ms: u64,
    errors: u64,
}

impl EnhancedManager {
    pub fn new(
        config: EnhancedConfig,
        channel: Box<dyn PeerChannel>,
        store: Arc<dyn ChangeStore>,
        chunk_store: Box<dyn ChunkStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            channel,
            cipher: None,
            messages: MessageManager::new(config.messages),
            sync: SyncManager::new(config.sync, store),
            transfers: TransferManager::new(config.transfer, chunk_store),
            events,
            peers: BTreeSet::new(),
            running: false,
            started_at: 0,
            now_ms: 0,
            errors: 0,
        }
    }

    /// Seal every frame with `cipher`. Both ends must agree.
    pub fn with_cipher(mut self, cipher: Box<dyn FrameCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_journal(mut self, journal: Box<dyn TransferJournal>) -> Self {
        self.transfers = self.transfers.with_journal(journal);
        self
    }

    /// Start the managers at `now_ms` and reload journaled transfers. Calling it again while
    /// running does nothing.
    pub fn initialize(&mut self, now_ms: u64) -> Result<(), EnhancedError> {
        if self.running {
            return Ok(());
        }
        self.now_ms = now_ms;
        self.started_at = now_ms;
        self.messages.tick(now_ms);
        self.sync.tick(now_ms);
        self.transfers.tick(now_ms);
        let restored = self.transfers.restore_from_journal()?;
        self.running = true;
        info!(restored, "p2p manager started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn subscribe(&self) -> broadcast::Receiver<P2pEvent> {
        self.events.subscribe()
    }

    /// A direct channel to `peer` is up.
    pub fn add_peer(&mut self, peer: &PeerId) {
        if self.peers.insert(peer.clone()) {
            debug!(peer = %peer, "peer connected");
        }
        self.sync.add_peer(peer);
    }

    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.sync.remove_peer(peer);
        self.transfers.on_peer_disconnected(peer);
        info!(peer = %peer, "peer disconnected");
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn send_message(&mut self, peer: &PeerId, payload: Value) -> Result<MessageId, EnhancedError> {
        self.send_message_with(peer, payload, SendOptions::default())
    }

    pub fn send_message_with(
        &mut self,
        peer: &PeerId,
        payload: Value,
        options: SendOptions,
    ) -> Result<MessageId, EnhancedError> {
        self.ensure_running()?;
        let id = self.messages.send_message(peer, payload, options)?;
        self.pump();
        Ok(id)
    }

    /// Raw bytes from the channel. Returns how many messages were delivered (duplicates excluded).
    pub fn on_receive(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<usize, EnhancedError> {
        let result = self.receive_frames(peer, bytes);
        if let Err(e) = &result {
            warn!(peer = %peer, "dropping inbound bytes: {}", e);
            self.publish(P2pEvent::Error {
                kind: ErrorKind::MalformedInput,
                message: format!("from {}: {}", peer, e),
            });
        }
        self.pump();
        result
    }

    fn receive_frames(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<usize, EnhancedError> {
        let opened;
        let bytes = match &self.cipher {
            Some(cipher) => {
                opened = cipher.open(peer, bytes)?;
                opened.as_slice()
            }
            None => bytes,
        };
        let mut delivered = 0;
        for frame in wire::decode_frames(bytes)? {
            match frame {
                Frame::Batch { messages } => {
                    for message in self.messages.handle_batch(peer, messages) {
                        delivered += 1;
                        self.handle_incoming_message(IncomingMessage {
                            peer_id: peer.clone(),
                            message_id: message.id,
                            kind: message.kind,
                            payload: message.payload,
                        });
                    }
                }
                Frame::Ack { message_ids } => self.messages.on_ack(peer, &message_ids),
            }
        }
        Ok(delivered)
    }

    /// Route one delivered message by kind: `sync:` and `transfer:` traffic to their managers,
    /// anything else to the host as a `message` event.
    pub fn handle_incoming_message(&mut self, incoming: IncomingMessage) {
        let IncomingMessage {
            peer_id,
            message_id,
            kind,
            payload,
        } = incoming;
        if kinds::is_sync(&kind) {
            if let Err(e) = self.sync.handle_message(&peer_id, &kind, payload) {
                self.report(ErrorKind::Sync, format!("sync message from {}: {}", peer_id, e));
            }
        } else if kinds::is_transfer(&kind) {
            if let Err(e) = self.transfers.handle_message(&peer_id, &kind, payload) {
                self.report(ErrorKind::Transfer, format!("transfer message from {}: {}", peer_id, e));
            }
        } else {
            self.publish(P2pEvent::Message {
                peer: peer_id,
                message_id,
                kind,
                payload,
            });
        }
        self.pump();
    }

    /// Advance every manager's clock and flush what came due.
    pub fn tick(&mut self, now_ms: u64) {
        if !self.running {
            return;
        }
        self.now_ms = now_ms;
        let sync = self.sync.tick(now_ms);
        let transfers = self.transfers.tick(now_ms);
        self.apply(sync);
        self.apply(transfers);
        // Sends queued above go out with this tick's flush.
        let messages = self.messages.tick(now_ms);
        self.dispatch(messages);
    }

    pub fn trigger_sync(&mut self, peer: &PeerId) -> Result<bool, EnhancedError> {
        self.ensure_running()?;
        let started = self.sync.trigger_sync(peer)?;
        self.pump();
        Ok(started)
    }

    pub fn upload_file(&mut self, peer: &PeerId, path: &Path) -> Result<String, EnhancedError> {
        self.ensure_running()?;
        let id = self.transfers.upload_file(peer, path)?;
        self.pump();
        Ok(id)
    }

    pub fn accept_transfer(&mut self, transfer_id: &str, dest: &Path) -> Result<(), EnhancedError> {
        self.ensure_running()?;
        let result = self.transfers.accept_transfer(transfer_id, dest);
        self.pump();
        Ok(result?)
    }

    pub fn reject_transfer(&mut self, transfer_id: &str, reason: &str) -> Result<(), EnhancedError> {
        let result = self.transfers.reject_transfer(transfer_id, reason);
        self.pump();
        Ok(result?)
    }

    pub fn cancel_transfer(&mut self, transfer_id: &str) -> Result<(), EnhancedError> {
        let result = self.transfers.cancel_transfer(transfer_id);
        self.pump();
        Ok(result?)
    }

    pub fn resume_transfer(&mut self, transfer_id: &str) -> Result<(), EnhancedError> {
        self.ensure_running()?;
        let result = self.transfers.resume_transfer(transfer_id);
        self.pump();
        Ok(result?)
    }

    pub fn get_progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        self.transfers.get_progress(transfer_id)
    }

    /// File work queued by transfers since the last call. Run each job off the dispatch path
    /// (see [`driver::spawn_io`](crate::driver::spawn_io)) and hand its outcome to
    /// [`complete_io`](Self::complete_io).
    pub fn take_io_jobs(&mut self) -> Vec<IoJob> {
        self.transfers.take_io_jobs()
    }

    /// Apply a finished file job and flush what it produced. Dropped after `stop`; the journal
    /// then lacks the chunk and a resume requests it again.
    pub fn complete_io(&mut self, outcome: IoOutcome) {
        if !self.running {
            debug!(transfer = %outcome.transfer_id(), "file job finished after stop");
            return;
        }
        if let Err(e) = self.transfers.complete_io(outcome) {
            self.report(ErrorKind::Transfer, format!("file job: {}", e));
        }
        self.pump();
    }

    /// Run queued file work on the calling thread. Returns how many jobs ran.
    pub fn run_io(&mut self) -> usize {
        if !self.running {
            return 0;
        }
        let ran = self.transfers.run_io();
        self.pump();
        ran
    }

    pub fn messages(&self) -> &MessageManager {
        &self.messages
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    pub fn get_stats(&self) -> EnhancedStats {
        let messages = self.messages.stats().clone();
        let sync = self.sync.stats().clone();
        let transfer = self.transfers.stats().clone();
        EnhancedStats {
            is_running: self.running,
            uptime_ms: if self.running {
                self.now_ms.saturating_sub(self.started_at)
            } else {
                0
            },
            connected_peers: self.peers.len(),
            total_messages: messages.sent + messages.received,
            total_syncs: sync.rounds_completed + sync.rounds_answered,
            total_file_transfers: transfer.uploads_started + transfer.downloads_started,
            errors: self.errors,
            messages,
            sync,
            transfer,
        }
    }

    /// Flush queued batches, cancel every timer and close the channel. Safe to call at any
    /// point, including before or after a failed `initialize`.
    pub fn stop(&mut self) {
        self.messages.stop();
        self.sync.stop();
        self.transfers.stop();
        let flushed = self.messages.drain_actions();
        self.dispatch(flushed);
        self.channel.close();
        if self.running {
            info!("p2p manager stopped");
        }
        self.running = false;
    }

    fn ensure_running(&self) -> Result<(), EnhancedError> {
        if self.running {
            Ok(())
        } else {
            Err(EnhancedError::NotRunning)
        }
    }

    /// Move work between managers: sync/transfer output into the message manager, message
    /// manager output onto the channel.
    fn pump(&mut self) {
        let sync = self.sync.drain_actions();
        let transfers = self.transfers.drain_actions();
        self.apply(sync);
        self.apply(transfers);
        let messages = self.messages.drain_actions();
        self.dispatch(messages);
    }

    fn apply(&mut self, actions: Vec<ManagerAction>) {
        for action in actions {
            match action {
                ManagerAction::Send {
                    peer,
                    options,
                    payload,
                } => {
                    if let Err(e) = self.messages.send_message(&peer, payload, options) {
                        self.report(ErrorKind::Channel, format!("queueing for {}: {}", peer, e));
                    }
                }
                ManagerAction::Emit(event) => self.publish(event),
            }
        }
    }

    fn dispatch(&mut self, actions: Vec<MessageAction>) {
        for action in actions {
            match action {
                MessageAction::SendBatch { peer, messages } => {
                    self.write_frame(&peer, &Frame::Batch { messages });
                }
                MessageAction::SendAck { peer, message_ids } => {
                    self.write_frame(&peer, &Frame::Ack { message_ids });
                }
                MessageAction::DeliveryFailed {
                    peer,
                    message_id,
                    attempts,
                } => self.publish(P2pEvent::DeliveryFailed {
                    peer,
                    message_id,
                    attempts,
                }),
            }
        }
    }

    fn write_frame(&mut self, peer: &PeerId, frame: &Frame) {
        let bytes = match self.seal_frame(peer, frame) {
            Ok(bytes) => bytes,
            Err(message) => {
                self.report(ErrorKind::Channel, message);
                return;
            }
        };
        if let Err(e) = self.channel.send(peer, bytes) {
            self.report(ErrorKind::Channel, format!("send to {}: {}", peer, e));
        }
    }

    fn seal_frame(&self, peer: &PeerId, frame: &Frame) -> Result<Vec<u8>, String> {
        let bytes = wire::encode_frame(frame).map_err(|e: FrameEncodeError| e.to_string())?;
        match &self.cipher {
            Some(cipher) => cipher.seal(peer, &bytes).map_err(|e| e.to_string()),
            None => Ok(bytes),
        }
    }

    fn report(&mut self, kind: ErrorKind, message: String) {
        warn!(?kind, "{}", message);
        self.publish(P2pEvent::Error { kind, message });
    }

    fn publish(&mut self, event: P2pEvent) {
        if matches!(
            event,
            P2pEvent::Error { .. } | P2pEvent::DeliveryFailed { .. } | P2pEvent::TransferFailed { .. }
        ) {
            self.errors += 1;
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, MemoryChannel};
    use crate::seal::{Keypair, SessionCipher};
    use crate::sync::MemoryChangeStore;
    use crate::transfer::{FsChunkStore, TransferStatus};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::broadcast::error::TryRecvError;

    /// Channel handle the test keeps a second reference to.
    #[derive(Clone, Default)]
    struct SharedChannel(Arc<Mutex<MemoryChannel>>);

    impl SharedChannel {
        fn take_sent(&self) -> Vec<(PeerId, Vec<u8>)> {
            self.0.lock().unwrap().take_sent()
        }
    }

    impl PeerChannel for SharedChannel {
        fn send(&mut self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), ChannelError> {
            self.0.lock().unwrap().send(peer, bytes)
        }

        fn close(&mut self) {
            self.0.lock().unwrap().close();
        }
    }

    struct Node {
        id: PeerId,
        mgr: EnhancedManager,
        channel: SharedChannel,
        store: Arc<MemoryChangeStore>,
        events: broadcast::Receiver<P2pEvent>,
    }

    fn node(id: &str) -> Node {
        let config = EnhancedConfig {
            sync: SyncConfig {
                enable_auto_sync: false,
                ..SyncConfig::default()
            },
            ..EnhancedConfig::default()
        };
        node_with(id, config, None)
    }

    fn node_with(id: &str, config: EnhancedConfig, cipher: Option<SessionCipher>) -> Node {
        let channel = SharedChannel::default();
        let store = Arc::new(MemoryChangeStore::new());
        let mut mgr = EnhancedManager::new(
            config,
            Box::new(channel.clone()),
            store.clone(),
            Box::new(FsChunkStore),
        );
        if let Some(cipher) = cipher {
            mgr = mgr.with_cipher(Box::new(cipher));
        }
        mgr.initialize(0).unwrap();
        let events = mgr.subscribe();
        Node {
            id: PeerId::from(id),
            mgr,
            channel,
            store,
            events,
        }
    }

    fn connect(a: &mut Node, b: &mut Node) {
        a.mgr.add_peer(&b.id);
        b.mgr.add_peer(&a.id);
    }

    /// Deliver everything `from` has written to `to`. Returns the number of frames moved.
    fn shuttle(from: &Node, to: &mut Node) -> usize {
        let sent = from.channel.take_sent();
        let n = sent.len();
        for (peer, bytes) in sent {
            assert_eq!(peer, to.id);
            to.mgr.on_receive(&from.id, &bytes).unwrap();
        }
        n
    }

    /// Move frames and run file jobs until both sides are idle.
    fn settle(a: &mut Node, b: &mut Node) {
        while shuttle(a, b) + shuttle(b, a) + a.mgr.run_io() + b.mgr.run_io() > 0 {}
    }

    fn drain(rx: &mut broadcast::Receiver<P2pEvent>) -> Vec<P2pEvent> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(e) => out.push(e),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return out,
            }
        }
    }

    #[test]
    fn initialize_is_idempotent_and_stop_is_always_safe() {
        let mut never_started = EnhancedManager::new(
            EnhancedConfig::default(),
            Box::new(MemoryChannel::new()),
            Arc::new(MemoryChangeStore::new()),
            Box::new(FsChunkStore),
        );
        never_started.stop();
        assert!(!never_started.is_running());
        assert!(matches!(
            never_started.send_message(&PeerId::from("x"), json!(1)),
            Err(EnhancedError::NotRunning)
        ));

        let mut a = node("a");
        a.mgr.tick(500);
        a.mgr.initialize(400).unwrap();
        assert!(a.mgr.is_running());
        assert_eq!(a.mgr.get_stats().uptime_ms, 500);
        a.mgr.stop();
        a.mgr.stop();
        assert!(!a.mgr.is_running());
        assert!(a.channel.0.lock().unwrap().is_closed());
    }

    #[test]
    fn message_is_batched_then_delivered_once() {
        let (mut a, mut b) = (node("a"), node("b"));
        connect(&mut a, &mut b);
        let id = a.mgr.send_message(&b.id, json!({"text": "hello"})).unwrap();
        a.mgr.tick(100);
        let sent = a.channel.take_sent();
        assert_eq!(sent.len(), 1);
        let (_, frame) = &sent[0];

        assert_eq!(b.mgr.on_receive(&a.id, frame).unwrap(), 1);
        assert_eq!(b.mgr.on_receive(&a.id, frame).unwrap(), 0);
        let events = drain(&mut b.events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            P2pEvent::Message {
                peer,
                message_id,
                kind,
                payload,
            } => {
                assert_eq!(peer, &a.id);
                assert_eq!(message_id, &id);
                assert_eq!(kind, kinds::MESSAGE);
                assert_eq!(payload, &json!({"text": "hello"}));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(b.mgr.messages().stats().duplicates, 1);
    }

    #[test]
    fn acknowledged_message_stops_retrying() {
        let (mut a, mut b) = (node("a"), node("b"));
        connect(&mut a, &mut b);
        a.mgr
            .send_message_with(&b.id, json!("important"), SendOptions::default().with_ack().immediate())
            .unwrap();
        assert_eq!(a.mgr.messages().pending_acks(), 1);
        settle(&mut a, &mut b);
        assert_eq!(a.mgr.messages().pending_acks(), 0);
        a.mgr.tick(60_000);
        assert!(a.channel.take_sent().is_empty());
    }

    #[test]
    fn unacknowledged_message_surfaces_delivery_failure() {
        let mut a = node("a");
        let ghost = PeerId::from("ghost");
        a.mgr
            .send_message_with(&ghost, json!(1), SendOptions::default().with_ack().immediate())
            .unwrap();
        for t in 1..=40 {
            a.mgr.tick(t * 1_000);
        }
        let events = drain(&mut a.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, P2pEvent::DeliveryFailed { peer, .. } if *peer == ghost)));
        assert_eq!(a.mgr.get_stats().errors, 1);
    }

    #[test]
    fn sync_round_through_the_channel() {
        let (mut a, mut b) = (node("a"), node("b"));
        connect(&mut a, &mut b);
        a.store.write("n1", "Design", "from a", 10).unwrap();
        b.store.write("n2", "Notes", "from b", 20).unwrap();
        a.mgr.tick(1_000);
        b.mgr.tick(1_000);

        assert!(a.mgr.trigger_sync(&b.id).unwrap());
        settle(&mut a, &mut b);

        assert_eq!(a.store.len(), 2);
        assert_eq!(b.store.len(), 2);
        assert_eq!(b.store.get("n1").unwrap().unwrap().content, "from a");
        assert_eq!(a.mgr.sync().watermark(&b.id), 1_000);
        assert!(drain(&mut a.events)
            .iter()
            .any(|e| matches!(e, P2pEvent::SyncCompleted { .. })));
        // Sync traffic is routed, not re-emitted as application messages.
        assert!(!drain(&mut b.events)
            .iter()
            .any(|e| matches!(e, P2pEvent::Message { .. })));
        assert_eq!(a.mgr.get_stats().total_syncs, 1);
        assert_eq!(b.mgr.get_stats().total_syncs, 1);
    }

    #[test]
    fn file_transfer_through_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("report.pdf");
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&src, &data).unwrap();
        let dest = dir.path().join("received.pdf");

        let (mut a, mut b) = (node("a"), node("b"));
        connect(&mut a, &mut b);
        let id = a.mgr.upload_file(&b.id, &src).unwrap();
        settle(&mut a, &mut b);
        let offered = drain(&mut b.events).into_iter().find_map(|e| match e {
            P2pEvent::TransferRequest { metadata, .. } => Some(metadata),
            _ => None,
        });
        assert_eq!(offered.map(|m| m.transfer_id), Some(id.clone()));

        b.mgr.accept_transfer(&id, &dest).unwrap();
        // Chunk acks ride in batches; ticks flush them.
        for t in 1..=5 {
            settle(&mut a, &mut b);
            a.mgr.tick(t * 100);
            b.mgr.tick(t * 100);
        }
        settle(&mut a, &mut b);

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(b.mgr.get_progress(&id).unwrap().status, TransferStatus::Completed);
        let up = a.mgr.get_progress(&id).unwrap();
        assert_eq!(up.status, TransferStatus::Completed);
        assert_eq!(up.progress, 1.0);
        assert_eq!(a.mgr.get_stats().total_file_transfers, 1);
    }

    #[test]
    fn sealed_frames_need_the_session_key() {
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let (pa, pb) = (ka.public_key().clone(), kb.public_key().clone());
        let mut ca = SessionCipher::new(ka);
        let mut cb = SessionCipher::new(kb);
        ca.add_peer(PeerId::from("b"), &pb);
        cb.add_peer(PeerId::from("a"), &pa);

        let mut a = node_with("a", EnhancedConfig::default(), Some(ca));
        let mut b = node_with("b", EnhancedConfig::default(), Some(cb));

        a.mgr
            .send_message_with(&b.id, json!("secret"), SendOptions::default().immediate())
            .unwrap();
        let sent = a.channel.take_sent();
        assert!(!String::from_utf8_lossy(&sent[0].1).contains("secret"));
        assert_eq!(b.mgr.on_receive(&a.id, &sent[0].1).unwrap(), 1);

        let mut stranger = node("c");
        assert!(matches!(
            stranger.mgr.on_receive(&a.id, &sent[0].1),
            Err(EnhancedError::Frame(_))
        ));
        assert_eq!(stranger.mgr.get_stats().errors, 1);
    }

    #[test]
    fn garbage_bytes_are_reported_not_fatal() {
        let mut b = node("b");
        assert!(b.mgr.on_receive(&PeerId::from("a"), b"\x03\x00\x00\x00abc").is_err());
        let events = drain(&mut b.events);
        assert!(matches!(
            events.as_slice(),
            [P2pEvent::Error {
                kind: ErrorKind::MalformedInput,
                ..
            }]
        ));
        assert!(b.mgr.is_running());
    }

    #[test]
    fn channel_failures_become_error_events() {
        let mut a = node("a");
        let b = PeerId::from("b");
        a.channel.0.lock().unwrap().disconnect(&b);
        a.mgr
            .send_message_with(&b, json!(1), SendOptions::default().immediate())
            .unwrap();
        assert!(drain(&mut a.events)
            .iter()
            .any(|e| matches!(e, P2pEvent::Error { kind: ErrorKind::Channel, .. })));
    }

    #[test]
    fn stats_aggregate_managers() {
        let (mut a, mut b) = (node("a"), node("b"));
        connect(&mut a, &mut b);
        for n in 0..3 {
            a.mgr.send_message(&b.id, json!(n)).unwrap();
        }
        a.mgr.tick(250);
        settle(&mut a, &mut b);
        let stats = a.mgr.get_stats();
        assert!(stats.is_running);
        assert_eq!(stats.uptime_ms, 250);
        assert_eq!(stats.connected_peers, 1);
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.messages.batches_flushed, 1);
        assert_eq!(b.mgr.get_stats().total_messages, 3);
        assert_eq!(b.mgr.get_stats().errors, 0);
    }
}
