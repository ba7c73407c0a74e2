//! Peerlink P2P communication core.
//! Host-driven: no sockets; the host feeds bytes and a clock, and receives frames and events.
//! File work comes back as jobs for the host to run off its dispatch path.

pub mod channel;
pub mod chunk;
pub mod driver;
pub mod event;
pub mod integrity;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod scheduler;
pub mod seal;
pub mod signaling;
pub mod sync;
pub mod transfer;
pub mod wire;

pub use channel::{ChannelError, MemoryChannel, PeerChannel};
pub use event::{ErrorKind, ManagerAction, P2pEvent};
pub use manager::{EnhancedConfig, EnhancedError, EnhancedManager, EnhancedStats, IncomingMessage};
pub use message::{MessageConfig, MessageManager, SendOptions};
pub use protocol::{Frame, Message, MessageId, PeerId, PROTOCOL_VERSION};
pub use seal::{FrameCipher, Keypair, PublicKey, SessionCipher};
pub use signaling::{Envelope, SignalingClient, SignalingRelay};
pub use sync::{ChangeStore, MemoryChangeStore, SyncConfig, SyncManager};
pub use transfer::{FileJournal, FsChunkStore, IoJob, IoOutcome, TransferConfig, TransferManager};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
