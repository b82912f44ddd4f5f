//! Pane protocol messages.
//!
//! Every client frame carries a request id; the server answers each with
//! exactly one `response` or `error` frame carrying the same id. Live pane
//! output arrives as unsolicited `data` / `exit` / `stream_closed` frames.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Protocol version string sent in the server hello.
pub const PROTOCOL_VERSION: &str = "paned-v1";

/// Largest `data` payload the server puts in a single frame.
pub const MAX_DATA_CHUNK: usize = 64 * 1024;

/// Externally assigned, stable identity of one terminal pane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaneId(String);

impl PaneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PaneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PaneId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Observable lifecycle state of a pane session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneState {
    Starting,
    Attached,
    Detached,
    Exited,
    SpawnFailed,
    Closed,
}

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SpawnFailed,
    ProcessNotRunning,
    NotReady,
    PaneNotFound,
    TooManyPanes,
    InvalidRequest,
    Internal,
}

/// What a `write` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Bytes were queued to the running shell.
    Written,
    /// The pane had exited; this write started a fresh shell.
    Restarted,
    /// A restart triggered by an earlier write is still spawning.
    RestartPending,
}

/// How a pane's process was brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminateOutcome {
    /// There was no live process to stop.
    AlreadyExited,
    /// The process exited after the hangup signal.
    Graceful,
    /// The process had to be force-killed.
    Forced,
    /// The process survived the forced signal and is no longer managed.
    Unreaped { pid: Option<u32> },
}

/// Why a live subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The subscriber detached (explicitly or by dropping its stream).
    Detached,
    /// Another attach took over the pane.
    Superseded,
    /// The pane was killed.
    Killed,
    /// The server is shutting down.
    Shutdown,
}

/// Reply to a successful `create_or_attach`.
///
/// The bytes buffered while no subscriber was attached are not part of this
/// struct: they arrive as the first `data` event of the new stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachInfo {
    pub pane_id: PaneId,
    pub pane_is_new: bool,
    /// Opaque front-end snapshot stored by the last detach, empty if none.
    pub serialized_state: String,
    /// Length of the replayed buffer that opens the stream.
    pub buffered_bytes: usize,
    /// Set when detached output overflowed the buffer and old bytes were dropped.
    pub truncated: bool,
    /// Present when the shell has exited and awaits a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub cols: u16,
    pub rows: u16,
}

/// Diagnostic view of one pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneInfo {
    pub pane_id: PaneId,
    pub state: PaneState,
    pub cols: u16,
    pub rows: u16,
    pub buffered_bytes: usize,
    pub truncated: bool,
    /// Number of shells spawned under this pane.
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub has_subscriber: bool,
}

// ── Client → server ───────────────────────────────────────────────────

/// A request with its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Request {
    CreateOrAttach(CreateOrAttachParams),
    Write(WriteParams),
    Resize(ResizeParams),
    Detach(DetachParams),
    ClearScrollback(PaneRef),
    Kill(PaneRef),
    List,
    Ping,
}

impl Request {
    /// Pane the request targets, if any.
    pub fn pane_id(&self) -> Option<&PaneId> {
        match self {
            Request::CreateOrAttach(p) => Some(&p.pane_id),
            Request::Write(p) => Some(&p.pane_id),
            Request::Resize(p) => Some(&p.pane_id),
            Request::Detach(p) => Some(&p.pane_id),
            Request::ClearScrollback(p) | Request::Kill(p) => Some(&p.pane_id),
            Request::List | Request::Ping => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrAttachParams {
    pub pane_id: PaneId,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Written once right after a new shell spawns; ignored on reattach.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteParams {
    pub pane_id: PaneId,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Treat this write as the restart trigger if the shell has exited.
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeParams {
    pub pane_id: PaneId,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachParams {
    pub pane_id: PaneId,
    pub serialized_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaneRef {
    pub pane_id: PaneId,
}

// ── Server → client ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    Hello {
        version: String,
    },
    Response {
        id: u64,
        body: Response,
    },
    Error {
        id: u64,
        code: ErrorCode,
        /// Detail for the code, e.g. the pane id for `pane_not_found`.
        message: String,
    },
    Data {
        pane_id: PaneId,
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },
    Exit {
        pane_id: PaneId,
        code: i32,
    },
    StreamClosed {
        pane_id: PaneId,
        reason: CloseReason,
    },
    Shutdown {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Response {
    Attached(AttachInfo),
    Written(WriteOutcome),
    Ok,
    Killed(TerminateOutcome),
    Panes(Vec<PaneInfo>),
    Pong,
}

/// CBOR byte-string (de)serialization for `Vec<u8>` fields.
///
/// Without this, serde encodes `Vec<u8>` as an array of integers.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.0)
    }

    struct ByteBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::new();
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}
