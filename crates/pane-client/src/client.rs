//! The paned client.
//!
//! `PaneClient` owns one connection. A dispatch task routes every server
//! frame: replies go to the waiting request, pane events go to that pane's
//! [`PaneStream`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

use pane_core::messages::{
    CreateOrAttachParams, DetachParams, PaneRef, ResizeParams, WriteParams,
};
use pane_core::{
    AttachInfo, ClientFrame, CloseReason, PaneError, PaneId, PaneInfo, PaneResult, Request,
    Response, ServerFrame, TerminateOutcome, WriteOutcome, PROTOCOL_VERSION,
};

use crate::resize::{ResizeCoalescer, ResizeFn};
use crate::stream::{PaneStream, StreamEvent};
use crate::transport::{self, Link};

/// Configuration for a paned connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a request waits for its reply (and connect for the hello).
    pub request_timeout: Duration,
    /// Quiet period before a [`ResizeCoalescer`] sends a size.
    pub resize_debounce: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            resize_debounce: Duration::from_millis(100),
        }
    }
}

/// What the router does with a successful reply besides handing it back.
#[derive(Debug, Clone)]
enum Followup {
    None,
    /// Open the pane's stream before any of its events are routed.
    OpenStream(PaneId),
    /// End the pane's stream; its last events preceded the reply.
    EndStream(PaneId),
}

struct Reply {
    body: Response,
    stream: Option<PaneStream>,
}

struct Pending {
    tx: oneshot::Sender<PaneResult<Reply>>,
    followup: Followup,
}

#[derive(Default)]
struct RouterState {
    pending: HashMap<u64, Pending>,
    streams: HashMap<PaneId, mpsc::UnboundedSender<StreamEvent>>,
    closed: bool,
}

/// Correlates replies with requests and fans events out to pane streams.
#[derive(Default)]
struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(
        &self,
        id: u64,
        followup: Followup,
    ) -> PaneResult<oneshot::Receiver<PaneResult<Reply>>> {
        let mut state = self.lock();
        if state.closed {
            return Err(PaneError::Transport("connection closed".into()));
        }
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, Pending { tx, followup });
        Ok(rx)
    }

    fn forget(&self, id: u64) {
        self.lock().pending.remove(&id);
    }

    fn route(&self, frame: ServerFrame) {
        let mut state = self.lock();
        match frame {
            ServerFrame::Hello { version } => {
                tracing::debug!(version, "unexpected hello ignored");
            }
            ServerFrame::Response { id, body } => {
                let Some(pending) = state.pending.remove(&id) else {
                    tracing::debug!(id, "reply for unknown request");
                    return;
                };
                let stream = match (&pending.followup, &body) {
                    (Followup::OpenStream(pane_id), Response::Attached(_)) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        if let Some(old) = state.streams.insert(pane_id.clone(), tx) {
                            let _ = old.send(StreamEvent::Closed(CloseReason::Superseded));
                        }
                        Some(PaneStream::new(pane_id.clone(), rx))
                    }
                    (Followup::EndStream(pane_id), Response::Ok) => {
                        state.streams.remove(pane_id);
                        None
                    }
                    _ => None,
                };
                let _ = pending.tx.send(Ok(Reply { body, stream }));
            }
            ServerFrame::Error { id, code, message } => match state.pending.remove(&id) {
                Some(pending) => {
                    let _ = pending.tx.send(Err(PaneError::from_remote(code, message)));
                }
                None => tracing::debug!(id, ?code, "error for unknown request"),
            },
            ServerFrame::Data { pane_id, bytes } => {
                state.forward(&pane_id, StreamEvent::Data(bytes));
            }
            ServerFrame::Exit { pane_id, code } => {
                state.forward(&pane_id, StreamEvent::Exit(code));
            }
            ServerFrame::StreamClosed { pane_id, reason } => {
                if let Some(tx) = state.streams.remove(&pane_id) {
                    let _ = tx.send(StreamEvent::Closed(reason));
                }
            }
            ServerFrame::Shutdown { reason } => {
                tracing::info!(reason, "server shutting down");
                for (_, tx) in state.streams.drain() {
                    let _ = tx.send(StreamEvent::Closed(CloseReason::Shutdown));
                }
            }
        }
    }

    /// The connection is gone: fail waiting requests and end all streams.
    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.pending.clear();
        state.streams.clear();
    }
}

impl RouterState {
    fn forward(&mut self, pane_id: &PaneId, event: StreamEvent) {
        match self.streams.get(pane_id) {
            Some(tx) => {
                if tx.send(event).is_err() {
                    tracing::debug!(pane_id = %pane_id, "stream dropped by caller");
                    self.streams.remove(pane_id);
                }
            }
            None => tracing::trace!(pane_id = %pane_id, "event for unattached pane dropped"),
        }
    }
}

struct Inner {
    outgoing: mpsc::Sender<ClientFrame>,
    router: Arc<Router>,
    next_id: AtomicU64,
    config: ClientConfig,
    dispatch_handle: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispatch_handle.abort();
    }
}

/// Handle to one paned connection. Clones share the connection.
#[derive(Clone)]
pub struct PaneClient {
    inner: Arc<Inner>,
}

impl PaneClient {
    /// Connect to `ws://host:port` or `unix:/path` and wait for the hello.
    pub async fn connect(url: &str, config: ClientConfig) -> PaneResult<Self> {
        let link = time::timeout(config.request_timeout, transport::connect(url))
            .await
            .map_err(|_| PaneError::Timeout)??;
        Self::from_link(link, config).await
    }

    async fn from_link(link: Link, config: ClientConfig) -> PaneResult<Self> {
        let Link {
            outgoing,
            mut incoming,
        } = link;

        match time::timeout(config.request_timeout, incoming.recv()).await {
            Ok(Some(ServerFrame::Hello { version })) if version == PROTOCOL_VERSION => {
                tracing::debug!(version, "server hello");
            }
            Ok(Some(ServerFrame::Hello { version })) => {
                return Err(PaneError::InvalidMessage(format!(
                    "protocol mismatch: server speaks {version}, client {PROTOCOL_VERSION}"
                )));
            }
            Ok(Some(other)) => {
                return Err(PaneError::InvalidMessage(format!(
                    "expected hello, got {other:?}"
                )));
            }
            Ok(None) => return Err(PaneError::Transport("connection closed".into())),
            Err(_) => return Err(PaneError::Timeout),
        }

        let router = Arc::new(Router::default());
        let dispatch_handle = {
            let router = router.clone();
            tokio::spawn(async move {
                while let Some(frame) = incoming.recv().await {
                    router.route(frame);
                }
                tracing::debug!("connection closed");
                router.close();
            })
        };

        Ok(Self {
            inner: Arc::new(Inner {
                outgoing,
                router,
                next_id: AtomicU64::new(1),
                config,
                dispatch_handle,
            }),
        })
    }

    async fn request(&self, request: Request, followup: Followup) -> PaneResult<Reply> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.inner.router.register(id, followup)?;

        if self
            .inner
            .outgoing
            .send(ClientFrame { id, request })
            .await
            .is_err()
        {
            self.inner.router.forget(id);
            return Err(PaneError::Transport("connection closed".into()));
        }

        match time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(PaneError::Transport("connection closed".into())),
            Err(_) => {
                self.inner.router.forget(id);
                Err(PaneError::Timeout)
            }
        }
    }

    async fn call(&self, request: Request) -> PaneResult<Response> {
        Ok(self.request(request, Followup::None).await?.body)
    }

    /// Attach to a pane, creating and spawning it if absent.
    ///
    /// Restore `serialized_state` from the returned info first, then apply
    /// the stream's events in order.
    pub async fn create_or_attach(
        &self,
        params: CreateOrAttachParams,
    ) -> PaneResult<(AttachInfo, PaneStream)> {
        let pane_id = params.pane_id.clone();
        let reply = self
            .request(
                Request::CreateOrAttach(params),
                Followup::OpenStream(pane_id),
            )
            .await?;
        match (reply.body, reply.stream) {
            (Response::Attached(info), Some(stream)) => Ok((info, stream)),
            (other, _) => Err(unexpected(other)),
        }
    }

    /// Send input to the pane's shell.
    pub async fn write(&self, pane_id: &PaneId, data: &[u8]) -> PaneResult<WriteOutcome> {
        self.send_input(pane_id, data, false).await
    }

    /// Send input, starting a new shell if the pane's shell has exited.
    pub async fn restart(&self, pane_id: &PaneId, data: &[u8]) -> PaneResult<WriteOutcome> {
        self.send_input(pane_id, data, true).await
    }

    async fn send_input(
        &self,
        pane_id: &PaneId,
        data: &[u8],
        restart: bool,
    ) -> PaneResult<WriteOutcome> {
        let request = Request::Write(WriteParams {
            pane_id: pane_id.clone(),
            data: data.to_vec(),
            restart,
        });
        match self.call(request).await? {
            Response::Written(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Resize immediately. UI code should go through [`Self::resizer`].
    pub async fn resize(&self, pane_id: &PaneId, cols: u16, rows: u16) -> PaneResult<()> {
        let request = Request::Resize(ResizeParams {
            pane_id: pane_id.clone(),
            cols,
            rows,
        });
        expect_ok(self.call(request).await?)
    }

    /// Leave the pane, storing the front-end snapshot for the next attach.
    ///
    /// The pane's stream ends once every event sent before the detach has
    /// been delivered to it.
    pub async fn detach(&self, pane_id: &PaneId, serialized_state: String) -> PaneResult<()> {
        let request = Request::Detach(DetachParams {
            pane_id: pane_id.clone(),
            serialized_state,
        });
        let reply = self
            .request(request, Followup::EndStream(pane_id.clone()))
            .await?;
        expect_ok(reply.body)
    }

    pub async fn clear_scrollback(&self, pane_id: &PaneId) -> PaneResult<()> {
        let request = Request::ClearScrollback(PaneRef {
            pane_id: pane_id.clone(),
        });
        expect_ok(self.call(request).await?)
    }

    /// Terminate the pane's shell and forget the pane.
    pub async fn kill(&self, pane_id: &PaneId) -> PaneResult<TerminateOutcome> {
        let request = Request::Kill(PaneRef {
            pane_id: pane_id.clone(),
        });
        match self.call(request).await? {
            Response::Killed(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list(&self) -> PaneResult<Vec<PaneInfo>> {
        match self.call(Request::List).await? {
            Response::Panes(panes) => Ok(panes),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> PaneResult<()> {
        match self.call(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Debounced resizer for one pane; `current` is its size right now.
    pub fn resizer(&self, pane_id: PaneId, current: (u16, u16)) -> ResizeCoalescer {
        let client = self.clone();
        let apply: ResizeFn = Box::new(move |cols, rows| {
            let client = client.clone();
            let pane_id = pane_id.clone();
            Box::pin(async move { client.resize(&pane_id, cols, rows).await })
        });
        ResizeCoalescer::new(self.inner.config.resize_debounce, Some(current), apply)
    }
}

fn expect_ok(body: Response) -> PaneResult<()> {
    match body {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(body: Response) -> PaneError {
    PaneError::InvalidMessage(format!("unexpected reply: {body:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A client wired to in-process channels, plus the server's ends.
    async fn wired() -> (
        PaneClient,
        mpsc::Receiver<ClientFrame>,
        mpsc::Sender<ServerFrame>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        in_tx
            .send(ServerFrame::Hello {
                version: PROTOCOL_VERSION.into(),
            })
            .await
            .unwrap();
        let config = ClientConfig {
            request_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        };
        let client = PaneClient::from_link(
            Link {
                outgoing: out_tx,
                incoming: in_rx,
            },
            config,
        )
        .await
        .unwrap();
        (client, out_rx, in_tx)
    }

    fn attach_params(pane: &str) -> CreateOrAttachParams {
        CreateOrAttachParams {
            pane_id: pane.into(),
            cols: 80,
            rows: 24,
            cwd: None,
            env: None,
            initial_commands: Vec::new(),
        }
    }

    fn attached(pane: &str) -> Response {
        Response::Attached(AttachInfo {
            pane_id: pane.into(),
            pane_is_new: true,
            serialized_state: String::new(),
            buffered_bytes: 0,
            truncated: false,
            exit_code: None,
            cols: 80,
            rows: 24,
        })
    }

    #[tokio::test]
    async fn replies_match_requests_by_id() {
        let (client, mut server_rx, server_tx) = wired().await;
        let first = tokio::spawn({
            let client = client.clone();
            async move { client.ping().await }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.list().await }
        });

        let a = server_rx.recv().await.unwrap();
        let b = server_rx.recv().await.unwrap();
        // Answer out of order.
        for frame in [&b, &a] {
            let body = match frame.request {
                Request::Ping => Response::Pong,
                Request::List => Response::Panes(Vec::new()),
                _ => unreachable!(),
            };
            server_tx
                .send(ServerFrame::Response { id: frame.id, body })
                .await
                .unwrap();
        }

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn attach_opens_a_stream_that_sees_events_in_order() {
        let (client, mut server_rx, server_tx) = wired().await;
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.create_or_attach(attach_params("p")).await }
        });

        let request = server_rx.recv().await.unwrap();
        // The response and the first events arrive back to back.
        for frame in [
            ServerFrame::Response {
                id: request.id,
                body: attached("p"),
            },
            ServerFrame::Data {
                pane_id: "p".into(),
                bytes: b"buffered".to_vec(),
            },
            ServerFrame::Exit {
                pane_id: "p".into(),
                code: 3,
            },
            ServerFrame::StreamClosed {
                pane_id: "p".into(),
                reason: CloseReason::Superseded,
            },
        ] {
            server_tx.send(frame).await.unwrap();
        }

        let (info, mut stream) = pending.await.unwrap().unwrap();
        assert!(info.pane_is_new);
        assert_eq!(
            stream.next().await,
            Some(StreamEvent::Data(b"buffered".to_vec()))
        );
        assert_eq!(stream.next().await, Some(StreamEvent::Exit(3)));
        assert_eq!(
            stream.next().await,
            Some(StreamEvent::Closed(CloseReason::Superseded))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn server_errors_become_typed_errors() {
        let (client, mut server_rx, server_tx) = wired().await;
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.write(&"gone".into(), b"x").await }
        });
        let request = server_rx.recv().await.unwrap();
        server_tx
            .send(ServerFrame::Error {
                id: request.id,
                code: pane_core::ErrorCode::PaneNotFound,
                message: "gone".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            pending.await.unwrap(),
            Err(PaneError::PaneNotFound(_))
        ));
    }

    #[tokio::test]
    async fn detach_reply_ends_the_stream() {
        let (client, mut server_rx, server_tx) = wired().await;
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.create_or_attach(attach_params("d")).await }
        });
        let request = server_rx.recv().await.unwrap();
        server_tx
            .send(ServerFrame::Response {
                id: request.id,
                body: attached("d"),
            })
            .await
            .unwrap();
        let (_, mut stream) = pending.await.unwrap().unwrap();

        let detaching = tokio::spawn({
            let client = client.clone();
            async move { client.detach(&"d".into(), "SNAP".into()).await }
        });
        let request = server_rx.recv().await.unwrap();
        match &request.request {
            Request::Detach(params) => assert_eq!(params.serialized_state, "SNAP"),
            other => panic!("unexpected {other:?}"),
        }
        server_tx
            .send(ServerFrame::Data {
                pane_id: "d".into(),
                bytes: b"tail".to_vec(),
            })
            .await
            .unwrap();
        server_tx
            .send(ServerFrame::Response {
                id: request.id,
                body: Response::Ok,
            })
            .await
            .unwrap();
        detaching.await.unwrap().unwrap();

        assert_eq!(stream.next().await, Some(StreamEvent::Data(b"tail".to_vec())));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn lost_connection_fails_requests_and_streams() {
        let (client, mut server_rx, server_tx) = wired().await;
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.create_or_attach(attach_params("x")).await }
        });
        let request = server_rx.recv().await.unwrap();
        server_tx
            .send(ServerFrame::Response {
                id: request.id,
                body: attached("x"),
            })
            .await
            .unwrap();
        let (_, mut stream) = pending.await.unwrap().unwrap();

        let waiting = tokio::spawn({
            let client = client.clone();
            async move { client.ping().await }
        });
        server_rx.recv().await.unwrap();
        drop(server_tx);

        assert!(matches!(
            waiting.await.unwrap(),
            Err(PaneError::Transport(_))
        ));
        assert_eq!(stream.next().await, None);
        assert!(matches!(client.ping().await, Err(PaneError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (client, mut server_rx, _server_tx) = wired().await;
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.ping().await }
        });
        server_rx.recv().await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(PaneError::Timeout)));
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        in_tx
            .send(ServerFrame::Hello {
                version: "paned-v0".into(),
            })
            .await
            .unwrap();
        let result = PaneClient::from_link(
            Link {
                outgoing: out_tx,
                incoming: in_rx,
            },
            ClientConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(PaneError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn talks_to_a_websocket_server() {
        use futures_util::{SinkExt, StreamExt};
        use pane_core::{cbor_decode, cbor_encode};
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let hello = ServerFrame::Hello {
                version: PROTOCOL_VERSION.into(),
            };
            ws.send(Message::Binary(cbor_encode(&hello).unwrap().into()))
                .await
                .unwrap();
            while let Some(Ok(Message::Binary(data))) = ws.next().await {
                let frame: ClientFrame = cbor_decode(&data).unwrap();
                let reply = ServerFrame::Response {
                    id: frame.id,
                    body: Response::Pong,
                };
                ws.send(Message::Binary(cbor_encode(&reply).unwrap().into()))
                    .await
                    .unwrap();
            }
        });

        let client = PaneClient::connect(&format!("ws://{addr}"), ClientConfig::default())
            .await
            .unwrap();
        client.ping().await.unwrap();
        client.ping().await.unwrap();
    }
}
