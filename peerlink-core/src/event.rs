//! Host-facing events and the actions managers hand back to the orchestrator.

use serde::Serialize;
use serde_json::Value;

use crate::message::SendOptions;
use crate::protocol::{MessageId, PeerId};
use crate::sync::Conflict;
use crate::transfer::TransferMetadata;

/// Classes of failure surfaced through [`P2pEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Channel,
    MalformedInput,
    Sync,
    Transfer,
    Integrity,
}

/// Typed event published to subscribers of the enhanced manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum P2pEvent {
    /// Application message delivered exactly once.
    Message {
        peer: PeerId,
        message_id: MessageId,
        kind: String,
        payload: Value,
    },
    UploadProgress {
        transfer_id: String,
        progress: f64,
    },
    DownloadProgress {
        transfer_id: String,
        progress: f64,
    },
    /// A peer offered a file; accept or reject through the manager.
    TransferRequest {
        peer: PeerId,
        metadata: TransferMetadata,
    },
    TransferCompleted {
        transfer_id: String,
    },
    TransferFailed {
        transfer_id: String,
        reason: String,
    },
    TransferCancelled {
        transfer_id: String,
    },
    SyncConflict {
        peer: PeerId,
        conflict: Conflict,
    },
    SyncCompleted {
        peer: PeerId,
        applied: usize,
        conflicts: usize,
    },
    DeliveryFailed {
        peer: PeerId,
        message_id: MessageId,
        attempts: u32,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl P2pEvent {
    /// Event name as seen by hosts that dispatch on strings.
    pub fn name(&self) -> &'static str {
        match self {
            P2pEvent::Message { .. } => "message",
            P2pEvent::UploadProgress { .. } => "upload:progress",
            P2pEvent::DownloadProgress { .. } => "download:progress",
            P2pEvent::TransferRequest { .. } => "transfer:request",
            P2pEvent::TransferCompleted { .. } => "transfer:completed",
            P2pEvent::TransferFailed { .. } => "transfer:failed",
            P2pEvent::TransferCancelled { .. } => "transfer:cancelled",
            P2pEvent::SyncConflict { .. } => "sync:conflict",
            P2pEvent::SyncCompleted { .. } => "sync:completed",
            P2pEvent::DeliveryFailed { .. } => "delivery:failed",
            P2pEvent::Error { .. } => "error",
        }
    }
}

/// Output of the sync and transfer managers: a message to route through the message
/// manager, or an event for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerAction {
    Send {
        peer: PeerId,
        options: SendOptions,
        payload: Value,
    },
    Emit(P2pEvent),
}
