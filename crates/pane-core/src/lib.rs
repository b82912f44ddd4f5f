//! pane-core: shared protocol library for paned.
//!
//! Provides the pane request/response/event messages, the CBOR codec used
//! by both transports, and the error taxonomy shared by server and client.

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{cbor_decode, cbor_encode, frame_encode, FrameDecoder};
pub use error::{PaneError, PaneResult, SpawnError};
pub use messages::{
    AttachInfo, ClientFrame, CloseReason, ErrorCode, PaneId, PaneInfo, PaneState, Request,
    Response, ServerFrame, TerminateOutcome, WriteOutcome, PROTOCOL_VERSION,
};
