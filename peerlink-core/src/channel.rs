//! Raw peer channel: the already-connected byte pipe the managers ride on.

use std::collections::HashSet;

use crate::protocol::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("channel closed")]
    Closed,
    #[error("send failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound side of the transport. Inbound bytes are fed to `EnhancedManager::on_receive`.
pub trait PeerChannel: Send {
    fn send(&mut self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), ChannelError>;

    /// Release transport resources. Called on every `stop`.
    fn close(&mut self) {}
}

/// In-process channel that records what was sent. Peers listed with `disconnect` fail sends.
#[derive(Default)]
pub struct MemoryChannel {
    sent: Vec<(PeerId, Vec<u8>)>,
    offline: HashSet<PeerId>,
    closed: bool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent since the last call, in send order.
    pub fn take_sent(&mut self) -> Vec<(PeerId, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }

    pub fn disconnect(&mut self, peer: &PeerId) {
        self.offline.insert(peer.clone());
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl PeerChannel for MemoryChannel {
    fn send(&mut self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if self.offline.contains(peer) {
            return Err(ChannelError::NotConnected(peer.clone()));
        }
        self.sent.push((peer.clone(), bytes));
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_fails() {
        let mut ch = MemoryChannel::new();
        let a = PeerId::from("a");
        ch.send(&a, vec![1, 2]).unwrap();
        ch.disconnect(&a);
        assert!(matches!(
            ch.send(&a, vec![3]),
            Err(ChannelError::NotConnected(_))
        ));
        assert_eq!(ch.take_sent(), vec![(a.clone(), vec![1, 2])]);
        ch.close();
        assert!(ch.is_closed());
        assert!(matches!(ch.send(&PeerId::from("b"), vec![]), Err(ChannelError::Closed)));
    }
}
