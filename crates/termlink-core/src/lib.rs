//! termlink-core: Shared protocol library for the termlink terminal bridge.
//!
//! Provides the JSON message types and codec spoken over the upgrade
//! endpoint, session-id tokens, the reconnect backoff policy, an
//! incremental UTF-8 decoder for PTY output, and an injectable clock.

pub mod backoff;
pub mod clock;
pub mod codec;
pub mod error;
pub mod messages;
pub mod token;
pub mod utf8;

// Re-export commonly used items at crate root.
pub use backoff::{Backoff, ReconnectPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode_client, decode_server, encode};
pub use error::{BridgeError, BridgeResult};
pub use messages::{ClientMessage, ServerMessage, COMMAND_TERMINATOR, SESSION_QUERY_PARAM};
pub use token::SessionId;
pub use utf8::Utf8Decoder;
