//! Transport selection for paned connections.
//!
//! Selected from the URL:
//! - `ws://` → WebSocket, one binary message per CBOR frame
//! - `unix:` → Unix domain socket, length-prefixed CBOR frames
//!
//! Either way the socket is bridged onto a pair of channels, so the client
//! above only sees decoded frames.

use futures_util::{SinkExt, StreamExt};
use pane_core::{cbor_decode, cbor_encode, ClientFrame, PaneError, PaneResult, ServerFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const OUTGOING_QUEUE: usize = 64;
const INCOMING_QUEUE: usize = 256;

/// Transport kind, inferred from the connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Unix(String),
}

/// Determine the transport kind from a URL string.
pub fn detect_transport(url: &str) -> PaneResult<TransportKind> {
    if let Some(path) = url.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(PaneError::Transport("unix URL has no socket path".into()));
        }
        return Ok(TransportKind::Unix(path.to_string()));
    }
    if url.to_lowercase().starts_with("ws://") {
        return Ok(TransportKind::WebSocket);
    }
    Err(PaneError::Transport(format!(
        "unsupported URL scheme: {url} (expected ws:// or unix:)"
    )))
}

/// Channel ends of a live connection.
pub struct Link {
    pub outgoing: mpsc::Sender<ClientFrame>,
    pub incoming: mpsc::Receiver<ServerFrame>,
}

/// Connect and bridge the socket onto channels.
pub async fn connect(url: &str) -> PaneResult<Link> {
    match detect_transport(url)? {
        TransportKind::WebSocket => connect_ws(url).await,
        TransportKind::Unix(path) => connect_unix(&path).await,
    }
}

async fn connect_ws(url: &str) -> PaneResult<Link> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| PaneError::Transport(format!("WebSocket connect error: {e}")))?;
    tracing::info!(url, "WebSocket connected");

    let (mut sink, mut stream) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(OUTGOING_QUEUE);
    let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(INCOMING_QUEUE);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let bytes = match cbor_encode(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode request");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                tracing::debug!(error = %e, "WS send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => match cbor_decode::<ServerFrame>(&data) {
                    Ok(frame) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping malformed server frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "WS recv failed");
                    break;
                }
            }
        }
        tracing::debug!("WebSocket reader finished");
    });

    Ok(Link {
        outgoing: out_tx,
        incoming: in_rx,
    })
}

#[cfg(unix)]
async fn connect_unix(path: &str) -> PaneResult<Link> {
    use pane_core::{frame_encode, FrameDecoder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|e| PaneError::Transport(format!("Unix connect error: {e}")))?;
    tracing::info!(path, "Unix socket connected");

    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(OUTGOING_QUEUE);
    let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(INCOMING_QUEUE);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let bytes = match frame_encode(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode request");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&bytes).await {
                tracing::debug!(error = %e, "Unix write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "Unix read failed");
                    break;
                }
            };
            let frames: Vec<ServerFrame> = match decoder.feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::warn!(error = %e, "framing error, closing");
                    break;
                }
            };
            for frame in frames {
                if in_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    });

    Ok(Link {
        outgoing: out_tx,
        incoming: in_rx,
    })
}

#[cfg(not(unix))]
async fn connect_unix(_path: &str) -> PaneResult<Link> {
    Err(PaneError::Transport(
        "Unix sockets are not supported on this platform".into(),
    ))
}
