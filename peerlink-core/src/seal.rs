//! Frame sealing: optional per-peer encryption of raw channel frames.
//! Key distribution is the host's business; this only turns a peer's public key into a session.

use std::collections::HashMap;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::protocol::PeerId;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("no session key for peer {0}")]
    UnknownPeer(PeerId),
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("sealed frame too short")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
}

/// Opaque sealing capability applied to every encoded frame.
pub trait FrameCipher: Send {
    fn seal(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, SealError>;
    fn open(&self, peer: &PeerId, sealed: &[u8]) -> Result<Vec<u8>, SealError>;
}

/// X25519 public key, exchanged out of band.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Pairwise session key from an X25519 shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"peerlink-session-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// ChaCha20-Poly1305 over every frame, one key per peer.
/// Sealed layout: 12-byte random nonce, then ciphertext with tag.
pub struct SessionCipher {
    keypair: Keypair,
    sessions: HashMap<PeerId, [u8; 32]>,
}

impl SessionCipher {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            sessions: HashMap::new(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// Derive and store the session key for `peer`. Replaces any previous key.
    pub fn add_peer(&mut self, peer: PeerId, their_public: &PublicKey) {
        let key = derive_session_key(&self.keypair.shared_secret(their_public));
        self.sessions.insert(peer, key);
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.sessions.remove(peer);
    }

    fn cipher_for(&self, peer: &PeerId) -> Result<ChaCha20Poly1305, SealError> {
        let key = self
            .sessions
            .get(peer)
            .ok_or_else(|| SealError::UnknownPeer(peer.clone()))?;
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::Key)
    }
}

impl FrameCipher for SessionCipher {
    fn seal(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let cipher = self.cipher_for(peer)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let body = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + body.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn open(&self, peer: &PeerId, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        let cipher = self.cipher_for(peer)?;
        if sealed.len() < NONCE_LEN {
            return Err(SealError::Truncated);
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| SealError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SessionCipher, SessionCipher) {
        let mut a = SessionCipher::new(Keypair::generate());
        let mut b = SessionCipher::new(Keypair::generate());
        let (pa, pb) = (a.public_key().clone(), b.public_key().clone());
        a.add_peer(PeerId::from("b"), &pb);
        b.add_peer(PeerId::from("a"), &pa);
        (a, b)
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(
            a.shared_secret(b.public_key()),
            b.shared_secret(a.public_key())
        );
    }

    #[test]
    fn sealed_frame_opens_on_the_other_side() {
        let (a, b) = pair();
        let sealed = a.seal(&PeerId::from("b"), b"frame bytes").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"frame bytes");
        let opened = b.open(&PeerId::from("a"), &sealed).unwrap();
        assert_eq!(opened, b"frame bytes");
    }

    #[test]
    fn nonces_differ_per_seal() {
        let (a, _) = pair();
        let x = a.seal(&PeerId::from("b"), b"same").unwrap();
        let y = a.seal(&PeerId::from("b"), b"same").unwrap();
        assert_ne!(x, y);
    }

    #[test]
    fn tampering_and_unknown_peers_fail() {
        let (a, b) = pair();
        let mut sealed = a.seal(&PeerId::from("b"), b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(
            b.open(&PeerId::from("a"), &sealed),
            Err(SealError::Decrypt)
        ));
        assert!(matches!(
            b.open(&PeerId::from("a"), &[0u8; 4]),
            Err(SealError::Truncated)
        ));
        assert!(matches!(
            a.seal(&PeerId::from("c"), b"x"),
            Err(SealError::UnknownPeer(_))
        ));
    }
}
