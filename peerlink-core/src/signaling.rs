//! Signaling: JSON envelopes for connection negotiation, the relay state machine that routes
//! them between registered peers, and the client-side state machine.
//!
//! Both sides are host-driven. The relay sees connections as opaque ids and text frames; the
//! daemon in `peerlink-relay` owns the sockets.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Host-assigned identifier of one relay connection.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
}

/// Presence record held by the relay while the registering socket stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRegistration {
    pub peer_id: String,
    pub device_type: Option<String>,
    pub device_info: Option<DeviceInfo>,
    pub registered_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    Register {
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_info: Option<DeviceInfo>,
    },
    #[serde(rename_all = "camelCase")]
    Registered { peer_id: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        offer: Value,
        #[serde(default)]
        ice_restart: bool,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        answer: Value,
    },
    IceCandidates {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        candidates: Vec<Value>,
    },
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        payload: Value,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    GetPeers,
    PeersList { peers: Vec<String>, count: usize },
    #[serde(rename_all = "camelCase")]
    PeerOffline { peer_id: String },
}

const KNOWN_TYPES: &[&str] = &[
    "register",
    "registered",
    "offer",
    "answer",
    "ice-candidates",
    "message",
    "ping",
    "pong",
    "get-peers",
    "peers-list",
    "peer-offline",
];

impl Envelope {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::Registered { .. } => "registered",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::IceCandidates { .. } => "ice-candidates",
            Envelope::Message { .. } => "message",
            Envelope::Ping { .. } => "ping",
            Envelope::Pong { .. } => "pong",
            Envelope::GetPeers => "get-peers",
            Envelope::PeersList { .. } => "peers-list",
            Envelope::PeerOffline { .. } => "peer-offline",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope has no type")]
    MissingType,
    #[error("unknown envelope type {0:?}")]
    UnknownType(String),
}

/// Parse one text frame. Unknown types are reported separately so callers can ignore them quietly.
pub fn parse_envelope(text: &str) -> Result<Envelope, SignalingError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(SignalingError::MissingType)?;
    if !KNOWN_TYPES.contains(&kind) {
        return Err(SignalingError::UnknownType(kind.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// An offer with no answer after this long is reported back as `peer-offline`.
    pub offer_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            offer_timeout_ms: 10_000,
        }
    }
}

/// One envelope to write to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutput {
    pub conn: ConnectionId,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub connections: u64,
    pub registrations: u64,
    pub forwarded: u64,
    pub offline_notices: u64,
    pub malformed: u64,
}

struct PendingOffer {
    from: String,
    to: String,
    deadline: u64,
}

#[derive(Default)]
struct Connection {
    registration: Option<PeerRegistration>,
}

pub struct SignalingRelay {
    config: RelayConfig,
    now_ms: u64,
    connections: HashMap<ConnectionId, Connection>,
    /// Registered peer id -> the connection currently holding it.
    peers: BTreeMap<String, ConnectionId>,
    pending_offers: Vec<PendingOffer>,
    outputs: Vec<RelayOutput>,
    stats: RelayStats,
}

impl SignalingRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            now_ms: 0,
            connections: HashMap::new(),
            peers: BTreeMap::new(),
            pending_offers: Vec::new(),
            outputs: Vec::new(),
            stats: RelayStats::default(),
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Registered peer ids, sorted.
    pub fn peers(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn registration(&self, peer_id: &str) -> Option<&PeerRegistration> {
        let conn = self.peers.get(peer_id)?;
        self.connections.get(conn)?.registration.as_ref()
    }

    pub fn open(&mut self, conn: ConnectionId) {
        if let std::collections::hash_map::Entry::Vacant(slot) = self.connections.entry(conn) {
            slot.insert(Connection::default());
            self.stats.connections += 1;
        }
    }

    /// Handle one text frame from `conn`. Garbage is dropped; the connection stays open.
    pub fn handle_text(&mut self, conn: ConnectionId, text: &str) -> Vec<RelayOutput> {
        if !self.connections.contains_key(&conn) {
            self.open(conn);
        }
        match parse_envelope(text) {
            Ok(envelope) => self.handle_envelope(conn, envelope),
            Err(SignalingError::UnknownType(kind)) => {
                debug!(conn, kind = %kind, "ignoring unknown envelope type");
            }
            Err(e) => {
                self.stats.malformed += 1;
                debug!(conn, "ignoring malformed envelope: {}", e);
            }
        }
        self.drain()
    }

    fn handle_envelope(&mut self, conn: ConnectionId, envelope: Envelope) {
        match envelope {
            Envelope::Register {
                peer_id,
                device_type,
                device_info,
            } => self.register(conn, peer_id, device_type, device_info),
            Envelope::Ping { timestamp } => self.reply(conn, Envelope::Pong { timestamp }),
            Envelope::GetPeers => {
                let me = self.registered_id(conn);
                let peers: Vec<String> = self
                    .peers
                    .keys()
                    .filter(|p| Some(p.as_str()) != me.as_deref())
                    .cloned()
                    .collect();
                let count = peers.len();
                self.reply(conn, Envelope::PeersList { peers, count });
            }
            routed @ (Envelope::Offer { .. }
            | Envelope::Answer { .. }
            | Envelope::IceCandidates { .. }
            | Envelope::Message { .. }) => {
                let Some(from) = self.registered_id(conn) else {
                    debug!(conn, kind = routed.type_name(), "ignoring envelope from unregistered connection");
                    return;
                };
                self.route(conn, from, routed);
            }
            other => debug!(conn, kind = other.type_name(), "ignoring client-bound envelope"),
        }
    }

    fn register(
        &mut self,
        conn: ConnectionId,
        peer_id: String,
        device_type: Option<String>,
        device_info: Option<DeviceInfo>,
    ) {
        if peer_id.is_empty() {
            self.stats.malformed += 1;
            debug!(conn, "ignoring register without peer id");
            return;
        }
        // A connection re-registering under a new id gives up the old one.
        if let Some(old) = self.registered_id(conn).filter(|old| *old != peer_id) {
            self.peers.remove(&old);
        }
        if let Some(previous) = self.peers.insert(peer_id.clone(), conn) {
            if previous != conn {
                if let Some(c) = self.connections.get_mut(&previous) {
                    c.registration = None;
                }
                info!(peer = %peer_id, previous, conn, "registration replaced");
            }
        }
        if let Some(c) = self.connections.get_mut(&conn) {
            c.registration = Some(PeerRegistration {
                peer_id: peer_id.clone(),
                device_type,
                device_info,
                registered_at: self.now_ms,
            });
        }
        self.stats.registrations += 1;
        info!(peer = %peer_id, conn, "peer registered");
        self.reply(conn, Envelope::Registered { peer_id });
    }

    fn route(&mut self, conn: ConnectionId, from: String, envelope: Envelope) {
        let stamped = match envelope {
            Envelope::Offer {
                to,
                offer,
                ice_restart,
                ..
            } => Envelope::Offer {
                from: Some(from.clone()),
                to,
                offer,
                ice_restart,
            },
            Envelope::Answer { to, answer, .. } => Envelope::Answer {
                from: Some(from.clone()),
                to,
                answer,
            },
            Envelope::IceCandidates { to, candidates, .. } => Envelope::IceCandidates {
                from: Some(from.clone()),
                to,
                candidates,
            },
            Envelope::Message { to, payload, .. } => Envelope::Message {
                from: Some(from.clone()),
                to,
                payload,
            },
            _ => return,
        };
        let to = match &stamped {
            Envelope::Offer { to, .. }
            | Envelope::Answer { to, .. }
            | Envelope::IceCandidates { to, .. }
            | Envelope::Message { to, .. } => to.clone(),
            _ => return,
        };
        let Some(&target) = self.peers.get(&to) else {
            self.stats.offline_notices += 1;
            debug!(from = %from, to = %to, kind = stamped.type_name(), "target offline");
            self.reply(conn, Envelope::PeerOffline { peer_id: to });
            return;
        };
        match &stamped {
            Envelope::Offer { .. } => {
                self.pending_offers
                    .retain(|p| !(p.from == from && p.to == to));
                self.pending_offers.push(PendingOffer {
                    from: from.clone(),
                    to: to.clone(),
                    deadline: self.now_ms + self.config.offer_timeout_ms,
                });
            }
            Envelope::Answer { .. } => {
                self.pending_offers
                    .retain(|p| !(p.from == to && p.to == from));
            }
            _ => {}
        }
        self.stats.forwarded += 1;
        self.reply(target, stamped);
    }

    /// Connection gone: drop its presence and tell anyone waiting on an answer from it.
    pub fn close(&mut self, conn: ConnectionId) -> Vec<RelayOutput> {
        let Some(connection) = self.connections.remove(&conn) else {
            return Vec::new();
        };
        if let Some(registration) = connection.registration {
            let peer_id = registration.peer_id;
            if self.peers.get(&peer_id) == Some(&conn) {
                self.peers.remove(&peer_id);
            }
            info!(peer = %peer_id, conn, "peer disconnected");
            let (waiting, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_offers)
                .into_iter()
                .filter(|p| p.from != peer_id)
                .partition(|p| p.to == peer_id);
            self.pending_offers = rest;
            for offer in waiting {
                self.notify_offline(&offer.from, offer.to);
            }
        }
        self.drain()
    }

    /// Advance time: offers past their deadline are answered with `peer-offline`.
    pub fn tick(&mut self, now_ms: u64) -> Vec<RelayOutput> {
        self.now_ms = now_ms;
        let (expired, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_offers)
            .into_iter()
            .partition(|p| now_ms >= p.deadline);
        self.pending_offers = rest;
        for offer in expired {
            warn!(from = %offer.from, to = %offer.to, "offer timed out");
            self.notify_offline(&offer.from, offer.to);
        }
        self.drain()
    }

    fn notify_offline(&mut self, recipient: &str, peer_id: String) {
        if let Some(&conn) = self.peers.get(recipient) {
            self.stats.offline_notices += 1;
            self.reply(conn, Envelope::PeerOffline { peer_id });
        }
    }

    fn registered_id(&self, conn: ConnectionId) -> Option<String> {
        self.connections
            .get(&conn)?
            .registration
            .as_ref()
            .map(|r| r.peer_id.clone())
    }

    fn reply(&mut self, conn: ConnectionId, envelope: Envelope) {
        self.outputs.push(RelayOutput { conn, envelope });
    }

    fn drain(&mut self) -> Vec<RelayOutput> {
        std::mem::take(&mut self.outputs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// ICE candidates for one target are held this long to travel as one envelope.
    pub ice_batch_delay_ms: u64,
    pub ice_batch_max: usize,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ice_batch_delay_ms: 50,
            ice_batch_max: 10,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
        }
    }
}

/// What the relay told us, typed.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Registered { peer_id: String },
    Offer {
        from: String,
        offer: Value,
        ice_restart: bool,
    },
    Answer { from: String, answer: Value },
    IceCandidates { from: String, candidates: Vec<Value> },
    Message { from: String, payload: Value },
    PeersList(Vec<String>),
    PeerOffline { peer_id: String },
    /// No pong within the timeout; the host should reconnect.
    ConnectionLost,
}

struct IceBatch {
    candidates: Vec<Value>,
    opened_at: u64,
}

pub struct SignalingClient {
    config: ClientConfig,
    peer_id: String,
    device_type: Option<String>,
    device_info: Option<DeviceInfo>,
    registered: bool,
    now_ms: u64,
    outgoing: Vec<Envelope>,
    ice: BTreeMap<String, IceBatch>,
    last_ping_at: u64,
    awaiting_pong_since: Option<u64>,
    lost: bool,
}

impl SignalingClient {
    pub fn new(
        peer_id: impl Into<String>,
        device_type: Option<String>,
        device_info: Option<DeviceInfo>,
        config: ClientConfig,
    ) -> Self {
        Self {
            config,
            peer_id: peer_id.into(),
            device_type,
            device_info,
            registered: false,
            now_ms: 0,
            outgoing: Vec::new(),
            ice: BTreeMap::new(),
            last_ping_at: 0,
            awaiting_pong_since: None,
            lost: false,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// (Re)start a session on a fresh socket: queue `register` and reset liveness.
    pub fn connect(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
        self.registered = false;
        self.lost = false;
        self.last_ping_at = now_ms;
        self.awaiting_pong_since = None;
        self.ice.clear();
        self.outgoing.push(Envelope::Register {
            peer_id: self.peer_id.clone(),
            device_type: self.device_type.clone(),
            device_info: self.device_info.clone(),
        });
    }

    pub fn send_offer(&mut self, to: &str, offer: Value, ice_restart: bool) {
        self.outgoing.push(Envelope::Offer {
            from: Some(self.peer_id.clone()),
            to: to.to_string(),
            offer,
            ice_restart,
        });
    }

    pub fn send_answer(&mut self, to: &str, answer: Value) {
        self.outgoing.push(Envelope::Answer {
            from: Some(self.peer_id.clone()),
            to: to.to_string(),
            answer,
        });
    }

    /// Queue a candidate for `to`. Goes out with its batch on a later tick, or right away
    /// once the batch is full.
    pub fn add_ice_candidate(&mut self, to: &str, candidate: Value) {
        let now = self.now_ms;
        let batch = self.ice.entry(to.to_string()).or_insert_with(|| IceBatch {
            candidates: Vec::new(),
            opened_at: now,
        });
        batch.candidates.push(candidate);
        if batch.candidates.len() >= self.config.ice_batch_max.max(1) {
            self.flush_ice(to);
        }
    }

    pub fn send_message(&mut self, to: &str, payload: Value) {
        self.outgoing.push(Envelope::Message {
            from: Some(self.peer_id.clone()),
            to: to.to_string(),
            payload,
        });
    }

    pub fn request_peers(&mut self) {
        self.outgoing.push(Envelope::GetPeers);
    }

    /// Handle one text frame from the relay. Malformed or unknown envelopes yield `None`.
    pub fn handle_text(&mut self, text: &str) -> Option<SignalingEvent> {
        let envelope = match parse_envelope(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("ignoring relay frame: {}", e);
                return None;
            }
        };
        match envelope {
            Envelope::Registered { peer_id } => {
                self.registered = true;
                Some(SignalingEvent::Registered { peer_id })
            }
            Envelope::Offer {
                from: Some(from),
                offer,
                ice_restart,
                ..
            } => Some(SignalingEvent::Offer {
                from,
                offer,
                ice_restart,
            }),
            Envelope::Answer {
                from: Some(from),
                answer,
                ..
            } => Some(SignalingEvent::Answer { from, answer }),
            Envelope::IceCandidates {
                from: Some(from),
                candidates,
                ..
            } => Some(SignalingEvent::IceCandidates { from, candidates }),
            Envelope::Message {
                from: Some(from),
                payload,
                ..
            } => Some(SignalingEvent::Message { from, payload }),
            Envelope::PeersList { peers, .. } => Some(SignalingEvent::PeersList(peers)),
            Envelope::PeerOffline { peer_id } => {
                self.ice.remove(&peer_id);
                Some(SignalingEvent::PeerOffline { peer_id })
            }
            Envelope::Ping { timestamp } => {
                self.outgoing.push(Envelope::Pong { timestamp });
                None
            }
            Envelope::Pong { .. } => {
                self.awaiting_pong_since = None;
                None
            }
            other => {
                debug!(kind = other.type_name(), "ignoring unexpected envelope");
                None
            }
        }
    }

    /// Advance time: flush due ICE batches, send heartbeats, detect a dead relay.
    pub fn tick(&mut self, now_ms: u64) -> Vec<SignalingEvent> {
        self.now_ms = now_ms;
        let due: Vec<String> = self
            .ice
            .iter()
            .filter(|(_, b)| now_ms.saturating_sub(b.opened_at) >= self.config.ice_batch_delay_ms)
            .map(|(to, _)| to.clone())
            .collect();
        for to in due {
            self.flush_ice(&to);
        }

        if self.lost {
            return Vec::new();
        }
        match self.awaiting_pong_since {
            Some(since) if now_ms.saturating_sub(since) >= self.config.pong_timeout_ms => {
                self.lost = true;
                self.registered = false;
                warn!(peer = %self.peer_id, "signaling relay stopped answering pings");
                return vec![SignalingEvent::ConnectionLost];
            }
            Some(_) => {}
            None if now_ms.saturating_sub(self.last_ping_at) >= self.config.ping_interval_ms => {
                self.last_ping_at = now_ms;
                self.awaiting_pong_since = Some(now_ms);
                self.outgoing.push(Envelope::Ping {
                    timestamp: Some(now_ms),
                });
            }
            None => {}
        }
        Vec::new()
    }

    /// Envelopes to write to the relay, in order.
    pub fn take_outgoing(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outgoing)
    }

    fn flush_ice(&mut self, to: &str) {
        if let Some(batch) = self.ice.remove(to) {
            if batch.candidates.is_empty() {
                return;
            }
            self.outgoing.push(Envelope::IceCandidates {
                from: Some(self.peer_id.clone()),
                to: to.to_string(),
                candidates: batch.candidates,
            });
        }
    }
}
