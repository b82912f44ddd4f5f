use std::path::PathBuf;

use thiserror::Error;

use crate::messages::ErrorCode;

/// Reasons a PTY-backed shell could not be started.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("working directory is not a directory: {}", .0.display())]
    InvalidCwd(PathBuf),

    #[error("shell executable not found: {0}")]
    ShellNotFound(String),

    #[error("failed to open PTY: {0}")]
    OpenPty(String),

    #[error("failed to start shell: {0}")]
    Exec(String),

    /// A spawn failure reported by the server, already formatted.
    #[error("{0}")]
    Remote(String),
}

/// Errors produced by the pane session layer and its protocol.
#[derive(Debug, Error)]
pub enum PaneError {
    #[error("spawn failed: {0}")]
    Spawn(#[from] SpawnError),

    #[error("process not running")]
    ProcessNotRunning,

    #[error("pane not ready: {0}")]
    NotReady(String),

    #[error("pane not found: {0}")]
    PaneNotFound(String),

    #[error("pane limit ({0}) reached")]
    TooManyPanes(usize),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl PaneError {
    /// Stable wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            PaneError::Spawn(_) => ErrorCode::SpawnFailed,
            PaneError::ProcessNotRunning => ErrorCode::ProcessNotRunning,
            PaneError::NotReady(_) => ErrorCode::NotReady,
            PaneError::PaneNotFound(_) => ErrorCode::PaneNotFound,
            PaneError::TooManyPanes(_) => ErrorCode::TooManyPanes,
            PaneError::Codec(_) | PaneError::InvalidMessage(_) => ErrorCode::InvalidRequest,
            PaneError::Transport(_)
            | PaneError::Config(_)
            | PaneError::Timeout
            | PaneError::Io(_)
            | PaneError::Other(_) => ErrorCode::Internal,
        }
    }

    /// Wire message for this error: the variant's payload where the code
    /// already names the kind, the full text otherwise.
    pub fn detail(&self) -> String {
        match self {
            PaneError::Spawn(e) => e.to_string(),
            PaneError::NotReady(s)
            | PaneError::PaneNotFound(s)
            | PaneError::Codec(s)
            | PaneError::InvalidMessage(s) => s.clone(),
            PaneError::TooManyPanes(limit) => limit.to_string(),
            _ => self.to_string(),
        }
    }

    /// Rebuild an error from a wire code and [`detail`](Self::detail)
    /// message (client side).
    pub fn from_remote(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::SpawnFailed => PaneError::Spawn(SpawnError::Remote(message)),
            ErrorCode::ProcessNotRunning => PaneError::ProcessNotRunning,
            ErrorCode::NotReady => PaneError::NotReady(message),
            ErrorCode::PaneNotFound => PaneError::PaneNotFound(message),
            ErrorCode::TooManyPanes => {
                PaneError::TooManyPanes(message.trim().parse().unwrap_or_default())
            }
            ErrorCode::InvalidRequest => PaneError::InvalidMessage(message),
            ErrorCode::Internal => PaneError::Other(message),
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for PaneError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        PaneError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for PaneError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        PaneError::Codec(e.to_string())
    }
}

pub type PaneResult<T> = Result<T, PaneError>;
