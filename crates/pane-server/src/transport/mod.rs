//! Transport listeners.
//!
//! Every accepted connection is bridged onto a pair of channels carrying
//! decoded [`ClientFrame`]s in and [`ServerFrame`]s out, so the connection
//! loop never sees the wire format. The inbound channel closes when the peer
//! goes away; dropping the outbound sender closes the socket.

#[cfg(unix)]
pub mod unix;
pub mod websocket;

use pane_core::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;

/// Decoded frames queued from a peer before its reader waits.
const INBOUND_QUEUE: usize = 64;

/// Encoded frames queued for a peer before senders wait.
const OUTBOUND_QUEUE: usize = 256;

/// One accepted client connection.
#[derive(Debug)]
pub struct Connection {
    /// Human-readable peer description for logs.
    pub peer: String,
    pub inbound: mpsc::Receiver<ClientFrame>,
    pub outbound: mpsc::Sender<ServerFrame>,
}

impl Connection {
    /// An in-process connection and the peer's ends of its channels.
    pub fn pair(
        peer: impl Into<String>,
    ) -> (Self, mpsc::Sender<ClientFrame>, mpsc::Receiver<ServerFrame>) {
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        (
            Self {
                peer: peer.into(),
                inbound: in_rx,
                outbound: out_tx,
            },
            in_tx,
            out_rx,
        )
    }
}
