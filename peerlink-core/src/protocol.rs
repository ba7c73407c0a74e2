//! Peer channel protocol: identifiers, the message record, frame bodies and message kinds.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version. Carried by signaling clients in their device info.
pub const PROTOCOL_VERSION: u8 = 1;

/// Addressable peer identifier, stable for the lifetime of a signaling session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Globally unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Fresh random identifier (UUID v4 based); two calls never return the same value.
    pub fn generate() -> Self {
        MessageId(format!("msg-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

/// One application or manager message carried inside a batch frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: u64,
    /// Payload is a base64 string of the DEFLATE-compressed JSON payload.
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub require_ack: bool,
}

/// Body of one length-prefixed frame on the raw peer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Messages for one peer, in enqueue order.
    Batch { messages: Vec<Message> },
    /// Acknowledges receipt of ack-requiring messages.
    #[serde(rename_all = "camelCase")]
    Ack { message_ids: Vec<MessageId> },
}

/// Message kinds. Anything outside the `sync:` and `transfer:` namespaces is application traffic.
pub mod kinds {
    pub const MESSAGE: &str = "message";

    pub const SYNC_CHANGES: &str = "sync:changes";
    pub const SYNC_REPLY: &str = "sync:reply";

    pub const TRANSFER_OFFER: &str = "transfer:offer";
    pub const TRANSFER_ACCEPT: &str = "transfer:accept";
    pub const TRANSFER_REJECT: &str = "transfer:reject";
    pub const TRANSFER_CHUNK_REQUEST: &str = "transfer:chunk-request";
    pub const TRANSFER_CHUNK: &str = "transfer:chunk";
    pub const TRANSFER_CHUNK_ACK: &str = "transfer:chunk-ack";
    pub const TRANSFER_COMPLETE: &str = "transfer:complete";
    pub const TRANSFER_CANCEL: &str = "transfer:cancel";

    pub fn is_sync(kind: &str) -> bool {
        kind.starts_with("sync:")
    }

    pub fn is_transfer(kind: &str) -> bool {
        kind.starts_with("transfer:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("msg-"));
    }

    #[test]
    fn frame_json_shape() {
        let frame = Frame::Ack {
            message_ids: vec![MessageId::from("m1")],
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["messageIds"][0], "m1");

        let msg = Message {
            id: MessageId::from("m2"),
            kind: kinds::MESSAGE.to_string(),
            payload: serde_json::json!({"text": "hi"}),
            timestamp: 7,
            compressed: false,
            require_ack: true,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["requireAck"], true);
    }

    #[test]
    fn kind_namespaces() {
        assert!(kinds::is_sync(kinds::SYNC_REPLY));
        assert!(kinds::is_transfer(kinds::TRANSFER_CHUNK));
        assert!(!kinds::is_sync(kinds::MESSAGE));
        assert!(!kinds::is_transfer("chat"));
    }
}
