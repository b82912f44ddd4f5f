//! Process-wide map from pane id to session.
//!
//! Sessions are created on first reference and only removed by an explicit
//! kill, a failed first spawn, or server shutdown. A client disconnecting
//! never removes one.

use super::session::{Session, SubscriberId, Subscription};
use super::SessionSettings;
use futures_util::future::join_all;
use pane_core::messages::CreateOrAttachParams;
use pane_core::{
    AttachInfo, CloseReason, PaneError, PaneId, PaneInfo, PaneResult, TerminateOutcome,
    WriteOutcome,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Owns every live pane session.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<PaneId, Arc<Session>>>,
    settings: Arc<SessionSettings>,
    max_panes: usize,
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings, max_panes: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings: Arc::new(settings),
            max_panes,
        }
    }

    /// Find the pane's session, creating and spawning it if absent, then
    /// attach a new subscriber to it.
    pub async fn create_or_attach(
        &self,
        params: &CreateOrAttachParams,
    ) -> PaneResult<(AttachInfo, Subscription)> {
        let (session, is_new) = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&params.pane_id) {
                Some(session) => (session.clone(), false),
                None => {
                    if sessions.len() >= self.max_panes {
                        return Err(PaneError::TooManyPanes(self.max_panes));
                    }
                    let spawn = self.settings.spawn_request(
                        params.cwd.as_deref(),
                        params.env.as_ref(),
                        params.cols,
                        params.rows,
                    );
                    let session =
                        Session::new(params.pane_id.clone(), self.settings.clone(), spawn);
                    sessions.insert(params.pane_id.clone(), session.clone());
                    info!(pane_id = %params.pane_id, "session created");
                    (session, true)
                }
            }
        };

        if is_new {
            if let Err(e) = session.start(&params.initial_commands).await {
                self.remove_if_current(&session).await;
                return Err(e);
            }
        }
        session.attach(params.cols, params.rows, is_new).await
    }

    /// Look up a pane.
    pub async fn get(&self, pane_id: &PaneId) -> PaneResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(pane_id)
            .cloned()
            .ok_or_else(|| PaneError::PaneNotFound(pane_id.to_string()))
    }

    pub async fn write(
        &self,
        pane_id: &PaneId,
        data: Vec<u8>,
        restart: bool,
    ) -> PaneResult<WriteOutcome> {
        self.get(pane_id).await?.write(data, restart).await
    }

    pub async fn resize(&self, pane_id: &PaneId, cols: u16, rows: u16) -> PaneResult<()> {
        self.get(pane_id).await?.resize(cols, rows).await
    }

    pub async fn detach(
        &self,
        pane_id: &PaneId,
        subscriber: SubscriberId,
        state: Option<String>,
    ) -> PaneResult<()> {
        self.get(pane_id).await?.detach(subscriber, state).await
    }

    pub async fn clear_scrollback(&self, pane_id: &PaneId) -> PaneResult<()> {
        self.get(pane_id).await?.clear_scrollback().await
    }

    /// Take the pane out of the registry so no request can reach it again.
    ///
    /// Its shell is still running; finish with [`terminate`].
    pub async fn remove(&self, pane_id: &PaneId) -> PaneResult<Arc<Session>> {
        let session = self
            .sessions
            .write()
            .await
            .remove(pane_id)
            .ok_or_else(|| PaneError::PaneNotFound(pane_id.to_string()))?;
        info!(pane_id = %pane_id, "session removed");
        Ok(session)
    }

    /// Diagnostic view of every pane, ordered by id.
    pub async fn list(&self) -> Vec<PaneInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.pane_id.cmp(&b.pane_id));
        infos
    }

    /// Number of panes.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every pane concurrently, giving up after `timeout`.
    ///
    /// Returns the number of panes that were closed in time.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let total = sessions.len();
        if total == 0 {
            return 0;
        }
        info!(panes = total, "closing all panes");

        let closing = join_all(sessions.iter().map(|s| s.close(CloseReason::Shutdown)));
        match tokio::time::timeout(timeout, closing).await {
            Ok(outcomes) => {
                for (session, outcome) in sessions.iter().zip(&outcomes) {
                    debug!(pane_id = %session.pane_id(), ?outcome, "pane shut down");
                    if let TerminateOutcome::Unreaped { pid } = outcome {
                        warn!(pane_id = %session.pane_id(), ?pid, "process left running");
                    }
                }
                total
            }
            Err(_) => {
                warn!(panes = total, ?timeout, "pane shutdown timed out");
                0
            }
        }
    }

    async fn remove_if_current(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session.pane_id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.pane_id());
            debug!(pane_id = %session.pane_id(), "failed session removed");
        }
    }
}

/// Close a removed pane's session, killing its shell.
///
/// The outcome reports a process that could not be reaped; the pane is gone
/// either way.
pub async fn terminate(session: Arc<Session>) -> TerminateOutcome {
    let outcome = session.close(CloseReason::Killed).await;
    if let TerminateOutcome::Unreaped { pid } = outcome {
        warn!(pane_id = %session.pane_id(), ?pid, "killed pane left an unmanaged process");
    }
    outcome
}
