//! Unix domain socket listener.
//!
//! The socket is a byte stream, so frames are length-prefixed CBOR decoded
//! with [`FrameDecoder`]. A framing error drops the connection since the
//! stream cannot be resynchronised.

use super::Connection;
use pane_core::{frame_encode, ClientFrame, FrameDecoder, PaneError, PaneResult};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bind the socket, replacing a stale socket file, and start accepting.
pub async fn start_listener(path: &Path) -> PaneResult<mpsc::Receiver<Connection>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        debug!(path = %path.display(), "removing stale socket");
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| PaneError::Transport(format!("unix bind failed: {e}")))?;

    info!(path = %path.display(), "Unix socket listener started");

    let (tx, rx) = mpsc::channel::<Connection>(64);
    tokio::spawn(async move {
        let mut next_id: u64 = 0;
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    next_id += 1;
                    debug!(conn = next_id, "Unix connection accepted");
                    if tx.send(bridge(stream, next_id)).await.is_err() {
                        warn!("Unix connection channel closed");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Unix accept failed");
                }
            }
        }
    });

    Ok(rx)
}

fn bridge(stream: UnixStream, id: u64) -> Connection {
    let (mut reader, mut writer) = stream.into_split();
    let (conn, in_tx, mut out_rx) = Connection::pair(format!("unix:{id}"));

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let bytes = match frame_encode(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(conn = id, error = %e, "failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&bytes).await {
                debug!(conn = id, error = %e, "Unix write failed");
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
                    debug!(conn = id, error = %e, "Unix read failed");
                    break;
                }
            };
            let frames: Vec<ClientFrame> = match decoder.feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(conn = id, error = %e, "framing error, closing");
                    break;
                }
            };
            for frame in frames {
                if in_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
        debug!(conn = id, "Unix reader finished");
    });

    conn
}

#[cfg(test)]
mod tests {
    use super::*;
    use pane_core::{cbor_decode, Request, ServerFrame};

    #[tokio::test]
    async fn length_prefixed_frames_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paned.sock");
        // A leftover file from a crashed server must not block the bind.
        std::fs::write(&path, b"stale").unwrap();

        let mut accepted = start_listener(&path).await.unwrap();
        let mut client = UnixStream::connect(&path).await.unwrap();
        let mut conn = accepted.recv().await.unwrap();

        let mut bytes = frame_encode(&ClientFrame {
            id: 1,
            request: Request::List,
        })
        .unwrap();
        bytes.extend(
            frame_encode(&ClientFrame {
                id: 2,
                request: Request::Ping,
            })
            .unwrap(),
        );
        client.write_all(&bytes).await.unwrap();
        assert_eq!(conn.inbound.recv().await.unwrap().id, 1);
        assert_eq!(conn.inbound.recv().await.unwrap().id, 2);

        conn.outbound
            .send(ServerFrame::Hello {
                version: "v".into(),
            })
            .await
            .unwrap();
        let mut len = [0u8; 4];
        client.read_exact(&mut len).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        client.read_exact(&mut payload).await.unwrap();
        let frame: ServerFrame = cbor_decode(&payload).unwrap();
        assert!(matches!(frame, ServerFrame::Hello { version } if version == "v"));
    }

    #[tokio::test]
    async fn garbage_length_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paned.sock");
        let mut accepted = start_listener(&path).await.unwrap();
        let mut client = UnixStream::connect(&path).await.unwrap();
        let mut conn = accepted.recv().await.unwrap();

        client.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        assert!(conn.inbound.recv().await.is_none());
    }
}
