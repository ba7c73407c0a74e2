//! Peerlink signaling relay daemon: config loading and the WebSocket server.

pub mod config;
pub mod server;

pub use config::RelayDaemonConfig;
pub use server::serve;
