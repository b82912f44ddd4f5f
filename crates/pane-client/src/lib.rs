//! pane-client: async client library for paned.
//!
//! Connects over WebSocket (`ws://host:port`) or a local Unix socket
//! (`unix:/path/to/paned.sock`), correlates requests with their replies,
//! and hands each attached pane its own event stream.
//!
//! # Quick Start
//!
//! ```no_run
//! use pane_client::{ClientConfig, CreateOrAttachParams, PaneClient, StreamEvent};
//!
//! # async fn example() -> pane_core::PaneResult<()> {
//! let client = PaneClient::connect("ws://127.0.0.1:7681", ClientConfig::default()).await?;
//! let (info, mut stream) = client
//!     .create_or_attach(CreateOrAttachParams {
//!         pane_id: "editor-1".into(),
//!         cols: 120,
//!         rows: 40,
//!         cwd: None,
//!         env: None,
//!         initial_commands: Vec::new(),
//!     })
//!     .await?;
//! // Restore `info.serialized_state` first, then apply the stream in order.
//! client.write(&info.pane_id, b"ls\n").await?;
//! while let Some(event) = stream.next().await {
//!     if let StreamEvent::Data(bytes) = event {
//!         print!("{}", String::from_utf8_lossy(&bytes));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod resize;
pub mod stream;
pub mod transport;

pub use client::{ClientConfig, PaneClient};
pub use resize::ResizeCoalescer;
pub use stream::{PaneStream, StreamEvent};
pub use transport::TransportKind;

pub use pane_core::messages::CreateOrAttachParams;
pub use pane_core::{PaneError, PaneResult};
