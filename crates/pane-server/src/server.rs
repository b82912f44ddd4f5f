//! Core server: accepts connections and runs the per-connection loop.
//!
//! Owns the session registry and the shutdown broadcast. Each connection
//! may hold live subscriptions to many panes; every subscription gets a
//! forwarder task that turns pane events into `data`/`exit` frames.
//!
//! Writes can wait indefinitely on a shell that stops reading, so they run on
//! a per-pane lane off the connection loop: input to one pane stays in order
//! while requests for other panes keep flowing.

use crate::config::ServerConfig;
use crate::session::registry::terminate;
use crate::session::{PaneEvent, SessionRegistry, SubscriberId, Subscription};
use crate::transport::{websocket, Connection};
use pane_core::messages::{WriteParams, MAX_DATA_CHUNK};
use pane_core::{
    ClientFrame, CloseReason, PaneError, PaneId, PaneResult, Request, Response, ServerFrame,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Notice from a forwarder that its subscription ended.
type StreamEnded = (PaneId, SubscriberId, CloseReason);

/// One live subscription held by a connection.
struct Attachment {
    subscriber: SubscriberId,
    forwarder: JoinHandle<()>,
}

/// A write waiting its turn on a pane's lane.
struct WriteJob {
    id: u64,
    params: WriteParams,
}

/// Per-connection state threaded through the dispatcher.
struct ConnectionContext {
    peer: String,
    outbound: mpsc::Sender<ServerFrame>,
    attachments: HashMap<PaneId, Attachment>,
    write_lanes: HashMap<PaneId, mpsc::UnboundedSender<WriteJob>>,
    ended_tx: mpsc::UnboundedSender<StreamEnded>,
}

impl ConnectionContext {
    async fn send(&self, frame: ServerFrame) {
        if self.outbound.send(frame).await.is_err() {
            debug!(peer = %self.peer, "outbound channel closed");
        }
    }
}

/// The paned server instance.
pub struct PaneServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl PaneServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.session.clone(),
            config.max_panes,
        ));
        Self {
            config,
            registry,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start the listeners and serve connections until they close.
    pub async fn run(self: Arc<Self>) -> PaneResult<()> {
        let (ws_addr, mut ws_rx) = websocket::start_listener(self.config.listen).await?;
        let mut unix_rx = self.start_unix_listener().await?;

        info!(
            ws = %ws_addr,
            socket = ?self.config.socket,
            max_panes = self.config.max_panes,
            "paned ready"
        );

        loop {
            tokio::select! {
                Some(conn) = ws_rx.recv() => {
                    tokio::spawn(self.clone().serve_connection(conn));
                }
                Some(conn) = next_connection(&mut unix_rx) => {
                    tokio::spawn(self.clone().serve_connection(conn));
                }
                else => {
                    info!("all listeners closed");
                    break;
                }
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn start_unix_listener(&self) -> PaneResult<Option<mpsc::Receiver<Connection>>> {
        match &self.config.socket {
            Some(path) => Ok(Some(crate::transport::unix::start_listener(path).await?)),
            None => Ok(None),
        }
    }

    #[cfg(not(unix))]
    async fn start_unix_listener(&self) -> PaneResult<Option<mpsc::Receiver<Connection>>> {
        if self.config.socket.is_some() {
            tracing::warn!("Unix sockets are not supported on this platform, ignoring socket");
        }
        Ok(None)
    }

    /// Tell every connection the server is going away, then close all panes.
    pub async fn shutdown(&self) {
        info!(
            panes = self.registry.count().await,
            "broadcasting shutdown to connected clients"
        );
        let _ = self.shutdown_tx.send(());
        let closed = self.registry.shutdown(self.config.shutdown_timeout).await;
        info!(closed, "panes closed");
    }

    /// Run one connection until the peer leaves or the server shuts down.
    ///
    /// Subscriptions still held when the connection ends are detached
    /// implicitly; their panes keep running.
    pub async fn serve_connection(self: Arc<Self>, conn: Connection) {
        let Connection {
            peer,
            mut inbound,
            outbound,
        } = conn;
        info!(peer = %peer, "client connected");

        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<StreamEnded>();
        let mut ctx = ConnectionContext {
            peer,
            outbound,
            attachments: HashMap::new(),
            write_lanes: HashMap::new(),
            ended_tx,
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        ctx.send(ServerFrame::Hello {
            version: PROTOCOL_VERSION.to_string(),
        })
        .await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(peer = %ctx.peer, "shutdown signal received, notifying client");
                    ctx.send(ServerFrame::Shutdown {
                        reason: "server shutdown".into(),
                    })
                    .await;
                    break;
                }

                Some((pane_id, subscriber, reason)) = ended_rx.recv() => {
                    let current = ctx.attachments.get(&pane_id).map(|a| a.subscriber);
                    if current == Some(subscriber) {
                        ctx.attachments.remove(&pane_id);
                        debug!(peer = %ctx.peer, pane_id = %pane_id, ?reason, "stream closed");
                        ctx.send(ServerFrame::StreamClosed { pane_id, reason }).await;
                    }
                }

                frame = inbound.recv() => match frame {
                    Some(frame) => self.dispatch(frame, &mut ctx).await,
                    None => {
                        debug!(peer = %ctx.peer, "peer closed");
                        break;
                    }
                }
            }
        }

        for (pane_id, attachment) in ctx.attachments.drain() {
            if let Err(e) = self
                .registry
                .detach(&pane_id, attachment.subscriber, None)
                .await
            {
                debug!(pane_id = %pane_id, error = %e, "implicit detach skipped");
            }
        }
        info!(peer = %ctx.peer, "client disconnected");
    }

    /// Handle one request and answer it with exactly one response or error.
    ///
    /// Writes and the teardown of a killed pane answer from their own tasks;
    /// everything else answers before the next frame is read.
    async fn dispatch(&self, frame: ClientFrame, ctx: &mut ConnectionContext) {
        let ClientFrame { id, request } = frame;
        trace!(peer = %ctx.peer, id, pane_id = ?request.pane_id(), "request");
        let result = match request {
            Request::CreateOrAttach(params) => {
                match self.registry.create_or_attach(&params).await {
                    Ok((info, subscription)) => {
                        // Let a superseded forwarder on this connection finish
                        // before the new stream's frames start.
                        if let Some(old) = ctx.attachments.remove(&params.pane_id) {
                            let _ = old.forwarder.await;
                        }
                        ctx.send(ServerFrame::Response {
                            id,
                            body: Response::Attached(info),
                        })
                        .await;
                        let attachment = Attachment {
                            subscriber: subscription.id(),
                            forwarder: spawn_forwarder(
                                params.pane_id.clone(),
                                subscription,
                                ctx.outbound.clone(),
                                ctx.ended_tx.clone(),
                            ),
                        };
                        ctx.attachments.insert(params.pane_id, attachment);
                        return;
                    }
                    Err(e) => Err(e),
                }
            }
            Request::Write(params) => {
                let outbound = ctx.outbound.clone();
                let lane = ctx
                    .write_lanes
                    .entry(params.pane_id.clone())
                    .or_insert_with(|| spawn_write_lane(self.registry.clone(), outbound));
                // The lane lives as long as its sender, so this cannot fail.
                let _ = lane.send(WriteJob { id, params });
                return;
            }
            Request::Resize(params) => self
                .registry
                .resize(&params.pane_id, params.cols, params.rows)
                .await
                .map(|()| Response::Ok),
            Request::Detach(params) => match ctx.attachments.remove(&params.pane_id) {
                Some(attachment) => {
                    let result = self
                        .registry
                        .detach(
                            &params.pane_id,
                            attachment.subscriber,
                            Some(params.serialized_state),
                        )
                        .await;
                    // Events queued before the detach go out ahead of the reply.
                    let _ = attachment.forwarder.await;
                    result.map(|()| Response::Ok)
                }
                // Not attached through this connection: nothing to release.
                None => self.registry.get(&params.pane_id).await.map(|_| Response::Ok),
            },
            Request::ClearScrollback(pane) => self
                .registry
                .clear_scrollback(&pane.pane_id)
                .await
                .map(|()| Response::Ok),
            Request::Kill(pane) => match self.registry.remove(&pane.pane_id).await {
                Ok(session) => {
                    // Queued writes drain into the closed pane and fail.
                    ctx.write_lanes.remove(&pane.pane_id);
                    let outbound = ctx.outbound.clone();
                    tokio::spawn(async move {
                        let outcome = terminate(session).await;
                        let _ = outbound
                            .send(ServerFrame::Response {
                                id,
                                body: Response::Killed(outcome),
                            })
                            .await;
                    });
                    return;
                }
                Err(e) => Err(e),
            },
            Request::List => Ok(Response::Panes(self.registry.list().await)),
            Request::Ping => Ok(Response::Pong),
        };

        match result {
            Ok(body) => ctx.send(ServerFrame::Response { id, body }).await,
            Err(e) => {
                debug!(peer = %ctx.peer, id, error = %e, "request failed");
                ctx.send(error_frame(id, &e)).await;
            }
        }
    }
}

fn error_frame(id: u64, e: &PaneError) -> ServerFrame {
    ServerFrame::Error {
        id,
        code: e.code(),
        message: e.detail(),
    }
}

/// Run one pane's writes in arrival order until the connection drops.
fn spawn_write_lane(
    registry: Arc<SessionRegistry>,
    outbound: mpsc::Sender<ServerFrame>,
) -> mpsc::UnboundedSender<WriteJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
    tokio::spawn(async move {
        while let Some(WriteJob { id, params }) = rx.recv().await {
            let frame = match registry
                .write(&params.pane_id, params.data, params.restart)
                .await
            {
                Ok(outcome) => ServerFrame::Response {
                    id,
                    body: Response::Written(outcome),
                },
                Err(e) => {
                    debug!(id, pane_id = %params.pane_id, error = %e, "write failed");
                    error_frame(id, &e)
                }
            };
            if outbound.send(frame).await.is_err() {
                break;
            }
        }
    });
    tx
}

/// Turn a subscription's events into frames until it ends.
fn spawn_forwarder(
    pane_id: PaneId,
    mut subscription: Subscription,
    outbound: mpsc::Sender<ServerFrame>,
    ended_tx: mpsc::UnboundedSender<StreamEnded>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let frames = match event {
                PaneEvent::Data(bytes) => data_frames(&pane_id, &bytes),
                PaneEvent::Exit { code } => vec![ServerFrame::Exit {
                    pane_id: pane_id.clone(),
                    code,
                }],
            };
            for frame in frames {
                if outbound.send(frame).await.is_err() {
                    // Connection gone; dropping the subscription detaches it.
                    return;
                }
            }
        }
        let reason = subscription.close_reason().unwrap_or(CloseReason::Detached);
        let _ = ended_tx.send((pane_id, subscription.id(), reason));
    })
}

/// Split output into frames of at most [`MAX_DATA_CHUNK`] bytes.
fn data_frames(pane_id: &PaneId, bytes: &[u8]) -> Vec<ServerFrame> {
    bytes
        .chunks(MAX_DATA_CHUNK)
        .map(|chunk| ServerFrame::Data {
            pane_id: pane_id.clone(),
            bytes: chunk.to_vec(),
        })
        .collect()
}

async fn next_connection(rx: &mut Option<mpsc::Receiver<Connection>>) -> Option<Connection> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
