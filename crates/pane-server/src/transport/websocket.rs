//! WebSocket listener using tokio-tungstenite.
//!
//! One binary message carries one bare CBOR frame. Text messages are
//! ignored and pings are answered.

use super::Connection;
use futures_util::{SinkExt, StreamExt};
use pane_core::{cbor_decode, cbor_encode, ClientFrame, PaneError, PaneResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Maximum accepted WebSocket message (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Bind the listener and start accepting.
///
/// Returns the bound address and a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> PaneResult<(SocketAddr, mpsc::Receiver<Connection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| PaneError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<Connection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                if tx.send(bridge(ws_stream, addr)).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Split the socket into a decoding reader task and an encoding writer task.
fn bridge(ws_stream: WebSocketStream<TcpStream>, remote: SocketAddr) -> Connection {
    let (mut sink, mut stream) = ws_stream.split();
    let (conn, in_tx, mut out_rx) = Connection::pair(format!("ws:{remote}"));
    let (pong_tx, mut pong_rx) = mpsc::channel::<Message>(8);

    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(frame) => match cbor_encode(&frame) {
                        Ok(bytes) => Message::Binary(bytes.into()),
                        Err(e) => {
                            warn!(remote = %remote, error = %e, "failed to encode frame");
                            continue;
                        }
                    },
                    None => break,
                },
                Some(pong) = pong_rx.recv() => pong,
            };
            if let Err(e) = sink.send(msg).await {
                debug!(remote = %remote, error = %e, "WS send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if data.len() > MAX_WS_FRAME_SIZE {
                        warn!(remote = %remote, len = data.len(), "WS frame too large, closing");
                        break;
                    }
                    match cbor_decode::<ClientFrame>(&data) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(remote = %remote, error = %e, "dropping malformed frame"),
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = pong_tx.try_send(Message::Pong(payload));
                }
                Ok(Message::Close(_)) => break,
                // Ignore text and other message types
                Ok(_) => continue,
                Err(e) => {
                    debug!(remote = %remote, error = %e, "WS recv failed");
                    break;
                }
            }
        }
        debug!(remote = %remote, "WebSocket reader finished");
    });

    conn
}
