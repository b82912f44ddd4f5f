//! Pane sessions: PTY lifecycle, detached-output buffering, attach/detach.

pub mod output_buffer;
pub mod pty;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod session;

pub use registry::SessionRegistry;
pub use session::{PaneEvent, SubscriberId, Subscription};

use pty::SpawnRequest;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// How new shells are launched.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub program: String,
    pub args: Vec<String>,
    pub term: String,
    /// Working directory when a request does not name one.
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// Per-session policy shared by every pane.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub shell: ShellSettings,
    /// Capacity of each pane's detached-output buffer, in bytes.
    pub buffer_capacity: usize,
    /// Depth of a subscriber's live event queue.
    pub event_queue: usize,
    /// Wait between hangup and forced kill.
    pub kill_timeout: Duration,
}

impl SessionSettings {
    /// Build the spawn request for a pane, layering request overrides on the
    /// configured shell.
    pub fn spawn_request(
        &self,
        cwd: Option<&str>,
        env: Option<&HashMap<String, String>>,
        cols: u16,
        rows: u16,
    ) -> SpawnRequest {
        let mut merged = self.shell.env.clone();
        if let Some(extra) = env {
            merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        SpawnRequest {
            program: self.shell.program.clone(),
            args: self.shell.args.clone(),
            cwd: cwd
                .map(crate::config::expand_tilde)
                .unwrap_or_else(|| self.shell.cwd.clone()),
            env: merged,
            term: self.shell.term.clone(),
            cols,
            rows,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> SessionSettings {
    SessionSettings {
        shell: ShellSettings {
            program: "/bin/sh".into(),
            args: Vec::new(),
            term: "xterm-256color".into(),
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
        },
        buffer_capacity: 64 * 1024,
        event_queue: 64,
        kill_timeout: Duration::from_secs(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_env_overrides_configured_env() {
        let mut settings = test_settings();
        settings.shell.env.insert("A".into(), "config".into());
        settings.shell.env.insert("B".into(), "config".into());
        let mut extra = HashMap::new();
        extra.insert("B".to_string(), "request".to_string());

        let req = settings.spawn_request(Some("/tmp"), Some(&extra), 100, 30);
        assert_eq!(req.env["A"], "config");
        assert_eq!(req.env["B"], "request");
        assert_eq!(req.cwd, PathBuf::from("/tmp"));
        assert_eq!((req.cols, req.rows), (100, 30));
    }

    #[test]
    fn missing_cwd_falls_back_to_configured() {
        let settings = test_settings();
        let req = settings.spawn_request(None, None, 80, 24);
        assert_eq!(req.cwd, std::env::temp_dir());
        assert_eq!(req.program, "/bin/sh");
    }
}
