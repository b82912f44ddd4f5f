//! Client-side resize coalescing.
//!
//! Layout changes can report dozens of sizes per second. The coalescer keeps
//! only the latest observation, waits until no new size has arrived for the
//! debounce interval, and sends that size unless it equals the last one sent.

use futures_util::future::BoxFuture;
use pane_core::PaneResult;
use std::time::Duration;
use tokio::sync::watch;

/// Applies one resize, normally a `resize` request to the server.
pub type ResizeFn = Box<dyn Fn(u16, u16) -> BoxFuture<'static, PaneResult<()>> + Send + Sync>;

/// Trailing-edge debouncer for one pane's terminal size.
///
/// Dropping it flushes a pending size without waiting out the interval.
pub struct ResizeCoalescer {
    latest: watch::Sender<Option<(u16, u16)>>,
}

impl ResizeCoalescer {
    /// `initial` is the size the pane already has, if known; observing it
    /// again sends nothing.
    pub fn new(debounce: Duration, initial: Option<(u16, u16)>, apply: ResizeFn) -> Self {
        let (latest, rx) = watch::channel(None);
        tokio::spawn(run(debounce, initial, rx, apply));
        Self { latest }
    }

    /// Record a size observed by the UI.
    pub fn observe(&self, cols: u16, rows: u16) {
        self.latest.send_replace(Some((cols, rows)));
    }
}

async fn run(
    debounce: Duration,
    mut last_sent: Option<(u16, u16)>,
    mut rx: watch::Receiver<Option<(u16, u16)>>,
    apply: ResizeFn,
) {
    loop {
        if rx.changed().await.is_err() {
            return;
        }

        let mut open = true;
        while open {
            tokio::select! {
                changed = rx.changed() => open = changed.is_ok(),
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        let latest = *rx.borrow_and_update();
        if let Some((cols, rows)) = latest {
            if last_sent == Some((cols, rows)) {
                tracing::trace!(cols, rows, "resize unchanged, skipped");
            } else {
                match apply(cols, rows).await {
                    Ok(()) => last_sent = Some((cols, rows)),
                    Err(e) => tracing::warn!(cols, rows, error = %e, "resize failed"),
                }
            }
        }

        if !open {
            return;
        }
    }
}
