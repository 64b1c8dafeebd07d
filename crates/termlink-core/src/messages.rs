//! Tagged JSON messages exchanged over a terminal channel.
//!
//! Every frame is a JSON object with a `type` discriminator. Types a peer
//! does not understand decode as `Unknown` and are ignored by the receiver.

use crate::token::SessionId;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Line terminator appended to `command` frames (what a terminal's Enter key sends).
pub const COMMAND_TERMINATOR: &str = "\r";

/// Query parameter on the upgrade request that carries a session id for reattachment.
pub const SESSION_QUERY_PARAM: &str = "sessionId";

/// Frames sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Raw keystrokes for the PTY.
    Input { data: String },
    /// Terminal size change.
    Resize { cols: u16, rows: u16 },
    /// A line of input; the server appends [`COMMAND_TERMINATOR`].
    Command { data: String },
    /// Heartbeat.
    Ping,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// The text this frame writes to the PTY, if any.
    pub fn pty_input(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Input { data } => Some(Cow::Borrowed(data)),
            Self::Command { data } => Some(Cow::Owned(format!("{data}{COMMAND_TERMINATOR}"))),
            _ => None,
        }
    }
}

/// Frames sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// First frame of every attach. Carries output buffered while no
    /// channel was attached; always precedes live output.
    Session {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        buffered: Option<String>,
    },
    /// Live PTY output.
    Output { data: String },
    /// The PTY process exited; the session no longer exists.
    Exit { code: i32 },
    /// Heartbeat reply.
    Pong,
    /// Fatal channel error (spawn failure, session limit).
    Error { message: String },
    #[serde(other)]
    Unknown,
}
