//! termlink-server: PTY sessions that survive reconnects.
//!
//! Accepts WebSocket upgrades on a single endpoint, spawns one
//! pseudo-terminal per session, and lets a client reattach to a running
//! session after its connection drops.

pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use config::{ConfigOverrides, ServerConfig};
pub use registry::{InMemoryRegistry, SessionRegistry};
pub use server::TermlinkServer;
