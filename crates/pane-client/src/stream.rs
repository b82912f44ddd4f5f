//! Per-pane event streams.

use pane_core::{CloseReason, PaneId};
use tokio::sync::mpsc;

/// One event on an attached pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Terminal output, in order. The first event after an attach carries
    /// the bytes buffered while the pane was detached.
    Data(Vec<u8>),
    /// The shell exited; a `restart` write brings up a new one.
    Exit(i32),
    /// The server ended this stream. Nothing follows.
    Closed(CloseReason),
}

/// Live output of one attached pane.
///
/// Ends with `None` after [`StreamEvent::Closed`], after this client's own
/// detach, or when the connection drops.
#[derive(Debug)]
pub struct PaneStream {
    pane_id: PaneId,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
}

impl PaneStream {
    pub(crate) fn new(pane_id: PaneId, rx: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self {
            pane_id,
            rx,
            done: false,
        }
    }

    pub fn pane_id(&self) -> &PaneId {
        &self.pane_id
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await;
        if matches!(event, None | Some(StreamEvent::Closed(_))) {
            self.done = true;
        }
        event
    }
}
