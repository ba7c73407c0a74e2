//! WebSocket front end for the signaling relay.
//!
//! One task per socket reads text frames and forwards them to a single relay task, which owns the
//! `SignalingRelay` state machine, ticks offer deadlines and writes replies back through per-socket
//! outboxes.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use peerlink_core::driver::now_millis;
use peerlink_core::signaling::{ConnectionId, RelayConfig, RelayOutput, SignalingRelay};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

enum Command {
    Open {
        conn: ConnectionId,
        outbox: mpsc::UnboundedSender<String>,
    },
    Text {
        conn: ConnectionId,
        text: String,
    },
    Close {
        conn: ConnectionId,
    },
}

/// Accept connections on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, config: RelayConfig, tick: Duration) -> anyhow::Result<()> {
    let (commands, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_relay(SignalingRelay::new(config), rx, tick));
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "signaling relay listening");
    }
    let mut next_conn: ConnectionId = 0;
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        next_conn += 1;
        debug!(conn = next_conn, %addr, "connection accepted");
        tokio::spawn(handle_socket(stream, next_conn, commands.clone()));
    }
}

async fn run_relay(
    mut relay: SignalingRelay,
    mut commands: mpsc::UnboundedReceiver<Command>,
    tick: Duration,
) {
    let mut outboxes: HashMap<ConnectionId, mpsc::UnboundedSender<String>> = HashMap::new();
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let due = relay.tick(now_millis());
                deliver(&outboxes, due);
                let out = match command {
                    Command::Open { conn, outbox } => {
                        outboxes.insert(conn, outbox);
                        relay.open(conn);
                        Vec::new()
                    }
                    Command::Text { conn, text } => relay.handle_text(conn, &text),
                    Command::Close { conn } => {
                        outboxes.remove(&conn);
                        relay.close(conn)
                    }
                };
                deliver(&outboxes, out);
            }
            _ = interval.tick() => {
                let due = relay.tick(now_millis());
                deliver(&outboxes, due);
            }
        }
    }
}

fn deliver(outboxes: &HashMap<ConnectionId, mpsc::UnboundedSender<String>>, outputs: Vec<RelayOutput>) {
    for RelayOutput { conn, envelope } in outputs {
        let Some(outbox) = outboxes.get(&conn) else {
            continue;
        };
        match envelope.to_text() {
            Ok(text) => {
                // Receiver gone means the socket is closing; its Close command follows.
                let _ = outbox.send(text);
            }
            Err(e) => warn!(conn, "cannot encode {} envelope: {}", envelope.type_name(), e),
        }
    }
}

async fn handle_socket(stream: TcpStream, conn: ConnectionId, commands: mpsc::UnboundedSender<Command>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(conn, "websocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let (outbox, mut pending) = mpsc::unbounded_channel::<String>();
    if commands.send(Command::Open { conn, outbox }).is_err() {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(text) = pending.recv().await {
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if commands.send(Command::Text { conn, text }).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => debug!(conn, "ignoring binary frame"),
            Ok(_) => {}
            Err(e) => {
                debug!(conn, "read error: {}", e);
                break;
            }
        }
    }
    let _ = commands.send(Command::Close { conn });
    // Dropping the outbox in the relay task ends the writer.
    let _ = writer.await;
    debug!(conn, "connection closed");
}
