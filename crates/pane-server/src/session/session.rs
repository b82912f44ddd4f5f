//! One pane: a shell process, its detached-output buffer, and at most one
//! live subscriber.
//!
//! All state lives behind a single per-session mutex. The lock is never held
//! across a PTY write, a spawn, or a wait for subscriber queue space, so a
//! slow client or shell cannot stall attach, detach, or resize on the pane.

use super::output_buffer::OutputBuffer;
use super::pty::{PtyEvent, PtyProcess, SpawnRequest};
use super::SessionSettings;
use pane_core::{
    AttachInfo, CloseReason, PaneError, PaneId, PaneInfo, PaneResult, PaneState,
    TerminateOutcome, WriteOutcome,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

/// Identity of one attachment to a pane.
pub type SubscriberId = u64;

/// Event on a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaneEvent {
    Data(Vec<u8>),
    /// The shell exited. Nothing follows until a restart.
    Exit { code: i32 },
}

enum Phase {
    /// Spawn in flight. `restart` is false for the pane's first shell.
    Starting { restart: bool },
    Running(Arc<PtyProcess>),
    Exited { code: i32 },
    SpawnFailed,
    Closed,
}

/// Whether the pre-restart snapshot still has to be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    None,
    Pending,
    Delivered,
}

struct Subscriber {
    id: SubscriberId,
    events: mpsc::Sender<PaneEvent>,
    closed: oneshot::Sender<CloseReason>,
}

struct SessionInner {
    phase: Phase,
    buffer: OutputBuffer,
    snapshot: String,
    replay: Replay,
    spawn: SpawnRequest,
    subscriber: Option<Subscriber>,
    next_subscriber: SubscriberId,
    generation: u64,
}

impl SessionInner {
    fn state(&self) -> PaneState {
        match self.phase {
            Phase::Starting { .. } => PaneState::Starting,
            Phase::Running(_) if self.subscriber.is_some() => PaneState::Attached,
            Phase::Running(_) => PaneState::Detached,
            Phase::Exited { .. } => PaneState::Exited,
            Phase::SpawnFailed => PaneState::SpawnFailed,
            Phase::Closed => PaneState::Closed,
        }
    }

    fn subscriber_id(&self) -> Option<SubscriberId> {
        self.subscriber.as_ref().map(|s| s.id)
    }

    fn release_subscriber(&mut self, reason: CloseReason) -> Option<SubscriberId> {
        let sub = self.subscriber.take()?;
        let _ = sub.closed.send(reason);
        Some(sub.id)
    }

    /// Drop the subscriber after it vanished without an explicit detach.
    fn implicit_detach(&mut self) {
        if self.replay == Replay::Delivered {
            self.snapshot.clear();
            self.replay = Replay::None;
        }
    }
}

/// Live output of one attachment.
///
/// Dropping it is an implicit detach: the shell keeps running and its
/// output is buffered until the next attach.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::Receiver<PaneEvent>,
    closed: oneshot::Receiver<CloseReason>,
    reason: Option<CloseReason>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<PaneEvent> {
        if self.reason.is_some() {
            return None;
        }
        tokio::select! {
            biased;
            Some(event) = self.events.recv() => Some(event),
            reason = &mut self.closed => {
                self.reason = Some(reason.unwrap_or(CloseReason::Killed));
                None
            }
        }
    }

    /// Why the subscription ended, once `recv` has returned `None`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason
    }
}

/// A terminal pane and its shell.
pub struct Session {
    pane_id: PaneId,
    settings: Arc<SessionSettings>,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// A new session in `Starting`; call [`Session::start`] to spawn its shell.
    pub fn new(pane_id: PaneId, settings: Arc<SessionSettings>, spawn: SpawnRequest) -> Arc<Self> {
        let buffer = OutputBuffer::new(settings.buffer_capacity);
        Arc::new(Self {
            pane_id,
            settings,
            inner: Mutex::new(SessionInner {
                phase: Phase::Starting { restart: false },
                buffer,
                snapshot: String::new(),
                replay: Replay::None,
                spawn,
                subscriber: None,
                next_subscriber: 1,
                generation: 0,
            }),
        })
    }

    pub fn pane_id(&self) -> &PaneId {
        &self.pane_id
    }

    /// Spawn the first shell and type the initial commands into it.
    ///
    /// Only a failed spawn is an error. Initial commands that cannot be
    /// delivered, because the shell already exited, are logged and dropped;
    /// the exit itself reaches the subscriber.
    pub async fn start(self: &Arc<Self>, initial_commands: &[String]) -> PaneResult<()> {
        let spawn = self.inner.lock().await.spawn.clone();
        let pty = match PtyProcess::spawn(spawn).await {
            Ok(spawned) => self.install(spawned, false).await?,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if matches!(inner.phase, Phase::Starting { .. }) {
                    inner.phase = Phase::SpawnFailed;
                }
                warn!(pane_id = %self.pane_id, error = %e, "spawn failed");
                return Err(e.into());
            }
        };

        for command in initial_commands {
            let mut line = command.clone().into_bytes();
            if !line.ends_with(b"\n") {
                line.push(b'\n');
            }
            if let Err(e) = pty.write(line).await {
                warn!(pane_id = %self.pane_id, error = %e, "initial commands not delivered");
                break;
            }
        }
        Ok(())
    }

    /// Make a freshly spawned process current and start pumping its output.
    async fn install(
        self: &Arc<Self>,
        (pty, events): (PtyProcess, mpsc::Receiver<PtyEvent>),
        restart: bool,
    ) -> PaneResult<Arc<PtyProcess>> {
        let pty = Arc::new(pty);
        let mut inner = self.inner.lock().await;
        if !matches!(inner.phase, Phase::Starting { .. }) {
            drop(inner);
            debug!(pane_id = %self.pane_id, "pane closed while spawning");
            pty.terminate(self.settings.kill_timeout).await;
            return Err(PaneError::PaneNotFound(self.pane_id.to_string()));
        }

        let (cols, rows) = (inner.spawn.cols, inner.spawn.rows);
        if let Err(e) = pty.resize(cols, rows) {
            warn!(pane_id = %self.pane_id, error = %e, "resize after spawn failed");
        }
        inner.generation += 1;
        if restart {
            inner.replay = Replay::Pending;
        }
        inner.phase = Phase::Running(pty.clone());
        let generation = inner.generation;
        drop(inner);

        info!(pane_id = %self.pane_id, generation, pid = ?pty.pid(), restart, "shell running");
        tokio::spawn(self.clone().pump(events, generation));
        Ok(pty)
    }

    /// Route process output to the subscriber or into the buffer.
    async fn pump(self: Arc<Self>, mut events: mpsc::Receiver<PtyEvent>, generation: u64) {
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(bytes) => {
                    trace!(pane_id = %self.pane_id, len = bytes.len(), "output");
                    if !self.deliver(bytes, generation).await {
                        return;
                    }
                }
                PtyEvent::Exited(code) => {
                    self.record_exit(code, generation).await;
                    return;
                }
            }
        }
    }

    /// Hand one chunk to the current subscriber, or buffer it if there is none.
    ///
    /// Returns `false` once this process generation is no longer current.
    async fn deliver(&self, bytes: Vec<u8>, generation: u64) -> bool {
        loop {
            let (id, tx) = {
                let mut inner = self.inner.lock().await;
                if inner.generation != generation || matches!(inner.phase, Phase::Closed) {
                    return false;
                }
                let Some(current) = inner.subscriber.as_ref().map(|s| (s.id, s.events.clone()))
                else {
                    inner.buffer.append(&bytes);
                    return true;
                };
                current
            };

            // Wait for queue space without the lock; the subscriber may
            // change meanwhile, in which case the chunk goes to whoever is
            // current on the next pass.
            match tx.reserve().await {
                Ok(permit) => {
                    let inner = self.inner.lock().await;
                    if inner.subscriber_id() == Some(id) {
                        permit.send(PaneEvent::Data(bytes));
                        return true;
                    }
                }
                Err(_) => {
                    let mut inner = self.inner.lock().await;
                    if inner.subscriber_id() == Some(id) {
                        inner.subscriber = None;
                        inner.implicit_detach();
                        info!(pane_id = %self.pane_id, subscriber = id, "subscriber gone, detached");
                    }
                }
            };
        }
    }

    async fn record_exit(&self, code: i32, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || !matches!(inner.phase, Phase::Running(_)) {
            return;
        }
        inner.phase = Phase::Exited { code };
        info!(pane_id = %self.pane_id, code, "shell exited");

        let Some((id, tx)) = inner.subscriber.as_ref().map(|s| (s.id, s.events.clone())) else {
            return;
        };
        drop(inner);
        self.send_exit(id, tx, code).await;
    }

    /// Queue the exit for a subscriber, detaching it if its stream is gone.
    async fn send_exit(&self, id: SubscriberId, tx: mpsc::Sender<PaneEvent>, code: i32) {
        if tx.send(PaneEvent::Exit { code }).await.is_err() {
            let mut inner = self.inner.lock().await;
            if inner.subscriber_id() == Some(id) {
                inner.subscriber = None;
                inner.implicit_detach();
            }
        }
    }

    /// Take over the pane's live stream.
    ///
    /// A previous subscriber is ended with [`CloseReason::Superseded`]. The
    /// new stream opens with everything buffered since the last subscriber
    /// left, followed by an `Exit` event if the shell is not running.
    pub async fn attach(
        &self,
        cols: u16,
        rows: u16,
        pane_is_new: bool,
    ) -> PaneResult<(AttachInfo, Subscription)> {
        let mut inner = self.inner.lock().await;
        let exit_code = match &inner.phase {
            Phase::Starting { restart: false } => {
                return Err(PaneError::NotReady(self.pane_id.to_string()))
            }
            Phase::SpawnFailed | Phase::Closed => {
                return Err(PaneError::PaneNotFound(self.pane_id.to_string()))
            }
            Phase::Running(pty) => {
                if let Err(e) = pty.resize(cols, rows) {
                    warn!(pane_id = %self.pane_id, error = %e, "resize on attach failed");
                }
                None
            }
            Phase::Starting { restart: true } => None,
            Phase::Exited { code } => Some(*code),
        };
        inner.spawn.cols = cols;
        inner.spawn.rows = rows;

        if let Some(old) = inner.release_subscriber(CloseReason::Superseded) {
            info!(pane_id = %self.pane_id, subscriber = old, "subscriber superseded");
        }

        let id = inner.next_subscriber;
        inner.next_subscriber += 1;

        let (tx, rx) = mpsc::channel(self.settings.event_queue.max(2));
        let buffered = inner.buffer.take();
        let buffered_bytes = buffered.bytes.len();
        if !buffered.bytes.is_empty() {
            let _ = tx.try_send(PaneEvent::Data(buffered.bytes));
        }
        if let Some(code) = exit_code {
            let _ = tx.try_send(PaneEvent::Exit { code });
        }

        if inner.replay == Replay::Pending {
            inner.replay = Replay::Delivered;
        }

        let (closed_tx, closed_rx) = oneshot::channel();
        inner.subscriber = Some(Subscriber {
            id,
            events: tx,
            closed: closed_tx,
        });

        info!(
            pane_id = %self.pane_id,
            subscriber = id,
            buffered_bytes,
            truncated = buffered.truncated,
            dropped_total = inner.buffer.dropped(),
            "subscriber attached"
        );

        let info = AttachInfo {
            pane_id: self.pane_id.clone(),
            pane_is_new,
            serialized_state: inner.snapshot.clone(),
            buffered_bytes,
            truncated: buffered.truncated,
            exit_code,
            cols,
            rows,
        };
        Ok((
            info,
            Subscription {
                id,
                events: rx,
                closed: closed_rx,
                reason: None,
            },
        ))
    }

    /// Forward input to the shell.
    ///
    /// With `restart` set, a write to an exited pane spawns a fresh shell
    /// instead; the triggering bytes are not forwarded.
    pub async fn write(self: &Arc<Self>, data: Vec<u8>, restart: bool) -> PaneResult<WriteOutcome> {
        let mut inner = self.inner.lock().await;
        let spawn = match &inner.phase {
            Phase::Running(pty) => {
                let pty = pty.clone();
                drop(inner);
                pty.write(data).await?;
                return Ok(WriteOutcome::Written);
            }
            Phase::Starting { restart: true } if restart => return Ok(WriteOutcome::RestartPending),
            Phase::Starting { .. } => return Err(PaneError::NotReady(self.pane_id.to_string())),
            Phase::Exited { .. } if !restart => return Err(PaneError::ProcessNotRunning),
            Phase::Exited { code } => {
                let code = *code;
                inner.phase = Phase::Starting { restart: true };
                (inner.spawn.clone(), code, inner.next_subscriber)
            }
            Phase::SpawnFailed | Phase::Closed => {
                return Err(PaneError::PaneNotFound(self.pane_id.to_string()))
            }
        };
        drop(inner);

        // Subscribers from `first_joined` on attached mid-restart and have
        // not seen the exit yet.
        let (request, code, first_joined) = spawn;
        info!(pane_id = %self.pane_id, "restarting shell");
        match PtyProcess::spawn(request).await {
            Ok(spawned) => {
                self.install(spawned, true).await?;
                Ok(WriteOutcome::Restarted)
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                let mut pending = None;
                if matches!(inner.phase, Phase::Starting { restart: true }) {
                    inner.phase = Phase::Exited { code };
                    pending = inner
                        .subscriber
                        .as_ref()
                        .filter(|s| s.id >= first_joined)
                        .map(|s| (s.id, s.events.clone()));
                }
                drop(inner);
                warn!(pane_id = %self.pane_id, error = %e, "restart failed");

                if let Some((id, tx)) = pending {
                    self.send_exit(id, tx, code).await;
                }
                Err(e.into())
            }
        }
    }

    /// Record the window size and apply it to a running shell.
    pub async fn resize(&self, cols: u16, rows: u16) -> PaneResult<()> {
        let mut inner = self.inner.lock().await;
        match &inner.phase {
            Phase::SpawnFailed | Phase::Closed => {
                return Err(PaneError::PaneNotFound(self.pane_id.to_string()))
            }
            Phase::Running(pty) => {
                pty.resize(cols, rows)?;
            }
            Phase::Starting { .. } | Phase::Exited { .. } => {}
        }
        inner.spawn.cols = cols;
        inner.spawn.rows = rows;
        Ok(())
    }

    /// Leave the live stream.
    ///
    /// Only the named subscriber can detach; a stale or repeated detach is a
    /// no-op. `Some(state)` replaces the stored snapshot. `None` marks an
    /// implicit detach, which keeps the previous snapshot.
    pub async fn detach(&self, subscriber: SubscriberId, state: Option<String>) -> PaneResult<()> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.phase, Phase::Closed) {
            return Err(PaneError::PaneNotFound(self.pane_id.to_string()));
        }
        if inner.subscriber_id() != Some(subscriber) {
            debug!(pane_id = %self.pane_id, subscriber, "stale detach ignored");
            return Ok(());
        }
        inner.release_subscriber(CloseReason::Detached);

        match state {
            Some(snapshot) => {
                inner.snapshot = snapshot;
                inner.replay = Replay::None;
            }
            None => inner.implicit_detach(),
        }
        info!(pane_id = %self.pane_id, subscriber, "subscriber detached");
        Ok(())
    }

    /// Forget the stored snapshot and buffered output.
    pub async fn clear_scrollback(&self) -> PaneResult<()> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.phase, Phase::Closed) {
            return Err(PaneError::PaneNotFound(self.pane_id.to_string()));
        }
        inner.snapshot.clear();
        inner.buffer.clear();
        inner.replay = Replay::None;
        debug!(pane_id = %self.pane_id, "scrollback cleared");
        Ok(())
    }

    /// Close the pane for good and bring its shell down.
    pub async fn close(&self, reason: CloseReason) -> TerminateOutcome {
        let mut inner = self.inner.lock().await;
        let previous = std::mem::replace(&mut inner.phase, Phase::Closed);
        inner.release_subscriber(reason);
        inner.buffer.clear();
        inner.snapshot.clear();
        drop(inner);

        let outcome = match previous {
            Phase::Running(pty) => pty.terminate(self.settings.kill_timeout).await,
            _ => TerminateOutcome::AlreadyExited,
        };
        info!(pane_id = %self.pane_id, ?reason, ?outcome, "pane closed");
        outcome
    }

    /// Diagnostic snapshot of the pane.
    pub async fn info(&self) -> PaneInfo {
        let inner = self.inner.lock().await;
        let (pid, exit_code) = match &inner.phase {
            Phase::Running(pty) => (pty.pid(), None),
            Phase::Exited { code } => (None, Some(*code)),
            _ => (None, None),
        };
        PaneInfo {
            pane_id: self.pane_id.clone(),
            state: inner.state(),
            cols: inner.spawn.cols,
            rows: inner.spawn.rows,
            buffered_bytes: inner.buffer.len(),
            truncated: inner.buffer.is_truncated(),
            generation: inner.generation,
            pid,
            exit_code,
            has_subscriber: inner.subscriber.is_some(),
        }
    }

    #[cfg(test)]
    pub(crate) async fn state(&self) -> PaneState {
        self.inner.lock().await.state()
    }

    #[cfg(test)]
    pub(crate) async fn buffered(&self) -> Vec<u8> {
        self.inner.lock().await.buffer.peek()
    }

    #[cfg(test)]
    pub(crate) async fn process(&self) -> Option<Arc<PtyProcess>> {
        match &self.inner.lock().await.phase {
            Phase::Running(pty) => Some(pty.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::test_settings;
    use std::time::Duration;

    pub(crate) async fn started(id: &str) -> Arc<Session> {
        let settings = Arc::new(test_settings());
        let spawn = settings.spawn_request(None, None, 80, 24);
        let session = Session::new(PaneId::from(id), settings, spawn);
        session.start(&[]).await.unwrap();
        session
    }

    /// Read events until the accumulated output contains `needle`.
    pub(crate) async fn read_until(sub: &mut Subscription, needle: &str) -> String {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, sub.recv()).await {
            if let PaneEvent::Data(bytes) = event {
                seen.extend(bytes);
                if String::from_utf8_lossy(&seen).contains(needle) {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    async fn wait_for_exit(sub: &mut Subscription) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, sub.recv()).await {
            if let PaneEvent::Exit { code } = event {
                return Some(code);
            }
        }
        None
    }

    /// Consume what is left on a subscription and return why it ended.
    pub(crate) async fn drain(sub: &mut Subscription) -> Option<CloseReason> {
        while sub.recv().await.is_some() {}
        sub.close_reason()
    }

    async fn wait_for_buffered(session: &Session, needle: &str) -> bool {
        for _ in 0..200 {
            if String::from_utf8_lossy(&session.buffered().await).contains(needle) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn reattach_returns_snapshot_then_detached_output() {
        let session = started("p1").await;
        let (info, mut sub) = session.attach(80, 24, true).await.unwrap();
        assert!(info.serialized_state.is_empty());

        session.write(b"echo hi$((1+1))\n".to_vec(), false).await.unwrap();
        assert!(read_until(&mut sub, "hi2").await.contains("hi2"));

        session.detach(sub.id(), Some("SNAP1".into())).await.unwrap();
        assert_eq!(drain(&mut sub).await, Some(CloseReason::Detached));
        assert_eq!(session.state().await, PaneState::Detached);

        session.write(b"echo bye$((1+1))\n".to_vec(), false).await.unwrap();
        assert!(wait_for_buffered(&session, "bye2").await);

        let (info, mut sub) = session.attach(80, 24, false).await.unwrap();
        assert_eq!(info.serialized_state, "SNAP1");
        assert!(info.buffered_bytes > 0);
        assert!(!info.truncated);
        match sub.recv().await {
            Some(PaneEvent::Data(bytes)) => {
                assert_eq!(bytes.len(), info.buffered_bytes);
                assert!(String::from_utf8_lossy(&bytes).contains("bye2"));
            }
            other => panic!("expected buffered data, got {other:?}"),
        }
        assert!(session.buffered().await.is_empty());
        session.close(CloseReason::Killed).await;
    }

    #[tokio::test]
    async fn second_attach_supersedes_first() {
        let session = started("p2").await;
        let (_, mut first) = session.attach(80, 24, true).await.unwrap();
        let (_, mut second) = session.attach(100, 30, false).await.unwrap();

        assert_eq!(drain(&mut first).await, Some(CloseReason::Superseded));

        // A detach from the superseded subscriber does not touch the new one.
        session.detach(first.id(), Some("stale".into())).await.unwrap();
        let info = session.info().await;
        assert!(info.has_subscriber);
        assert_eq!(info.state, PaneState::Attached);
        assert_eq!((info.cols, info.rows), (100, 30));

        session.write(b"echo two$((1+1))\n".to_vec(), false).await.unwrap();
        assert!(read_until(&mut second, "two2").await.contains("two2"));

        session.detach(second.id(), None).await.unwrap();
        session.detach(second.id(), None).await.unwrap();
        assert_eq!(session.state().await, PaneState::Detached);
        session.close(CloseReason::Killed).await;
    }

    #[tokio::test]
    async fn dropped_subscription_detaches_without_killing() {
        let session = started("p3").await;
        let (_, sub) = session.attach(80, 24, true).await.unwrap();
        drop(sub);

        session.write(b"echo kept$((1+1))\n".to_vec(), false).await.unwrap();
        assert!(wait_for_buffered(&session, "kept2").await);
        assert_eq!(session.state().await, PaneState::Detached);
        session.close(CloseReason::Killed).await;
    }

    #[tokio::test]
    async fn exited_pane_restarts_exactly_once() {
        let session = started("p4").await;
        let (_, mut sub) = session.attach(80, 24, true).await.unwrap();
        session.write(b"exit 7\n".to_vec(), false).await.unwrap();
        assert_eq!(wait_for_exit(&mut sub).await, Some(7));
        assert_eq!(session.state().await, PaneState::Exited);

        assert!(matches!(
            session.write(b"x".to_vec(), false).await,
            Err(PaneError::ProcessNotRunning)
        ));
        session.resize(90, 30).await.unwrap();

        let (a, b, c) = tokio::join!(
            session.write(b"a".to_vec(), true),
            session.write(b"b".to_vec(), true),
            session.write(b"c".to_vec(), true),
        );
        let outcomes = [a.unwrap(), b.unwrap(), c.unwrap()];
        let restarted = outcomes
            .iter()
            .filter(|o| **o == WriteOutcome::Restarted)
            .count();
        assert_eq!(restarted, 1, "outcomes: {outcomes:?}");

        let info = session.info().await;
        assert_eq!(info.generation, 2);
        assert_eq!((info.cols, info.rows), (90, 30));
        let pty = session.process().await.unwrap();
        assert_eq!(pty.size(), (90, 30));

        // The existing subscriber keeps streaming the new shell.
        session.write(b"\necho again$((1+1))\n".to_vec(), false).await.unwrap();
        assert!(read_until(&mut sub, "again2").await.contains("again2"));
        session.close(CloseReason::Killed).await;
    }

    #[tokio::test]
    async fn attach_to_exited_pane_ends_with_exit_event() {
        let session = started("p5").await;
        let (_, mut sub) = session.attach(80, 24, true).await.unwrap();
        session.detach(sub.id(), Some("before".into())).await.unwrap();
        assert_eq!(drain(&mut sub).await, Some(CloseReason::Detached));

        let pty = session.process().await.unwrap();
        pty.write(b"exit 2\n".to_vec()).await.unwrap();
        assert_eq!(pty.wait_exit(Duration::from_secs(5)).await, Some(2));
        for _ in 0..200 {
            if session.state().await == PaneState::Exited {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let (info, mut sub) = session.attach(80, 24, false).await.unwrap();
        assert_eq!(info.exit_code, Some(2));
        assert_eq!(info.serialized_state, "before");
        assert_eq!(wait_for_exit(&mut sub).await, Some(2));

        session.detach(sub.id(), Some("exit screen".into())).await.unwrap();
        let (info, _sub) = session.attach(80, 24, false).await.unwrap();
        assert_eq!(info.serialized_state, "exit screen");
    }

    #[tokio::test]
    async fn restart_replays_old_snapshot_once() {
        let session = started("p6").await;
        let (_, sub) = session.attach(80, 24, true).await.unwrap();
        session.detach(sub.id(), Some("old shell".into())).await.unwrap();
        session.process().await.unwrap().write(b"exit\n".to_vec()).await.unwrap();
        for _ in 0..200 {
            if session.state().await == PaneState::Exited {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert_eq!(
            session.write(Vec::new(), true).await.unwrap(),
            WriteOutcome::Restarted
        );
        let (info, sub) = session.attach(80, 24, false).await.unwrap();
        assert_eq!(info.serialized_state, "old shell");
        session.detach(sub.id(), None).await.unwrap();

        let (info, _sub) = session.attach(80, 24, false).await.unwrap();
        assert!(info.serialized_state.is_empty());
        session.close(CloseReason::Killed).await;
    }

    #[tokio::test]
    async fn failed_restart_reports_exit_to_subscriber_joined_mid_restart() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(test_settings());
        let spawn = settings.spawn_request(dir.path().to_str(), None, 80, 24);
        let session = Session::new(PaneId::from("p8"), settings, spawn);
        session.start(&[]).await.unwrap();

        let (_, mut first) = session.attach(80, 24, true).await.unwrap();
        session.write(b"exit 5\n".to_vec(), false).await.unwrap();
        assert_eq!(wait_for_exit(&mut first).await, Some(5));
        // The next spawn fails on the missing working directory.
        drop(dir);

        let (restart, attached) = tokio::join!(
            session.write(b"x".to_vec(), true),
            session.attach(80, 24, false),
        );
        assert!(matches!(restart, Err(PaneError::Spawn(_))));
        assert_eq!(session.state().await, PaneState::Exited);

        let (_, mut sub) = attached.unwrap();
        assert_eq!(wait_for_exit(&mut sub).await, Some(5));
        let extra = tokio::time::timeout(Duration::from_millis(300), sub.recv()).await;
        assert!(extra.is_err(), "unexpected event after exit: {extra:?}");
        session.close(CloseReason::Killed).await;
    }

    #[tokio::test]
    async fn overflow_while_detached_is_reported_at_attach() {
        let mut settings = test_settings();
        settings.buffer_capacity = 256;
        let settings = Arc::new(settings);
        let spawn = settings.spawn_request(None, None, 80, 24);
        let session = Session::new(PaneId::from("p9"), settings, spawn);
        session.start(&[]).await.unwrap();

        let (_, sub) = session.attach(80, 24, true).await.unwrap();
        session.detach(sub.id(), Some("small".into())).await.unwrap();
        session
            .write(
                b"i=0; while [ $i -lt 60 ]; do echo line$i; i=$((i+1)); done; echo tail$((6*7))\n"
                    .to_vec(),
                false,
            )
            .await
            .unwrap();
        assert!(wait_for_buffered(&session, "tail42").await);

        let (info, mut sub) = session.attach(80, 24, false).await.unwrap();
        assert!(info.truncated);
        assert_eq!(info.buffered_bytes, 256);
        match sub.recv().await {
            Some(PaneEvent::Data(bytes)) => {
                assert_eq!(bytes.len(), 256);
                let text = String::from_utf8_lossy(&bytes);
                assert!(text.contains("tail42"));
                assert!(!text.contains("line0\r"));
            }
            other => panic!("expected buffered data, got {other:?}"),
        }
        session.close(CloseReason::Killed).await;
    }

    #[tokio::test]
    async fn clear_scrollback_forgets_snapshot_and_buffer() {
        let session = started("p7").await;
        let (_, sub) = session.attach(80, 24, true).await.unwrap();
        session.detach(sub.id(), Some("SNAP".into())).await.unwrap();
        session.write(b"echo gone$((1+1))\n".to_vec(), false).await.unwrap();
        assert!(wait_for_buffered(&session, "gone2").await);

        session.clear_scrollback().await.unwrap();
        let pty = session.process().await.unwrap();
        assert!(pty.exit_code().is_none());
        let (info, _sub) = session.attach(80, 24, false).await.unwrap();
        assert!(info.serialized_state.is_empty());
        assert_eq!(info.buffered_bytes, 0);
        session.close(CloseReason::Killed).await;
    }

    #[tokio::test]
    async fn close_ends_subscription_and_rejects_calls() {
        let session = started("p8").await;
        let (_, mut sub) = session.attach(80, 24, true).await.unwrap();
        let outcome = session.close(CloseReason::Killed).await;
        assert!(matches!(
            outcome,
            TerminateOutcome::Graceful | TerminateOutcome::Forced
        ));
        assert_eq!(drain(&mut sub).await, Some(CloseReason::Killed));
        assert!(matches!(
            session.attach(80, 24, false).await,
            Err(PaneError::PaneNotFound(_))
        ));
        assert!(matches!(
            session.write(b"x".to_vec(), true).await,
            Err(PaneError::PaneNotFound(_))
        ));
        assert_eq!(
            session.close(CloseReason::Killed).await,
            TerminateOutcome::AlreadyExited
        );
    }

    #[tokio::test]
    async fn attach_while_starting_is_not_ready() {
        let settings = Arc::new(test_settings());
        let spawn = settings.spawn_request(None, None, 80, 24);
        let session = Session::new(PaneId::from("p9"), settings, spawn);
        assert!(matches!(
            session.attach(80, 24, true).await,
            Err(PaneError::NotReady(_))
        ));
        assert!(matches!(
            session.write(b"x".to_vec(), false).await,
            Err(PaneError::NotReady(_))
        ));
    }
}
