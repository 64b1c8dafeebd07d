//! termlink-client: reconnecting client for termlink terminal sessions.
//!
//! The [`ConnectionManager`] keeps one terminal session alive across network
//! drops: it reattaches by session id with exponential backoff, sends a
//! heartbeat, and reconnects immediately when the app returns from the
//! background. [`OutputRenderer`] writes the output stream into a terminal
//! surface, and [`gesture`] turns touch drags into scroll input.
//!
//! # Quick Start
//!
//! ```no_run
//! use termlink_client::{BridgeEvent, ConnectOptions, ConnectionManager};
//!
//! # async fn example() -> termlink_core::BridgeResult<()> {
//! let (handle, mut events) = ConnectionManager::connect(ConnectOptions {
//!     url: "ws://127.0.0.1:7681/terminal".into(),
//!     ..Default::default()
//! });
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         BridgeEvent::Connected(_) => handle.send_command("echo hello")?,
//!         BridgeEvent::Output(text) | BridgeEvent::Replay(text) => print!("{text}"),
//!         BridgeEvent::Exited(_) => break,
//!         BridgeEvent::ServerError(_) => {}
//!     }
//! }
//! handle.close()?;
//! # Ok(())
//! # }
//! ```

pub mod gesture;
pub mod manager;
pub mod probe;
pub mod renderer;
pub mod state;

// Re-export primary public types.
pub use gesture::{scroll_input, ScrollTarget, TouchEnd, TouchScroller};
pub use manager::{BridgeEvent, BridgeHandle, ConnectOptions, ConnectionManager};
pub use probe::{socket_addr, wait_for_server};
pub use renderer::{OutputRenderer, TerminalSurface, Vt100Surface};
pub use state::ConnectionState;

// Re-export termlink-core error types for convenience.
pub use termlink_core::{BridgeError, BridgeResult};
