//! Session-id tokens.
//!
//! A session id is 16 random bytes rendered as 32 lowercase hex characters.
//! It is the only thing a client needs to reattach, so it must be unguessable.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;

const TOKEN_BYTES: usize = 16;

/// Opaque, unguessable identifier of a running PTY session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let bytes: [u8; TOKEN_BYTES] = rng.gen();
        Self(hex::encode(bytes))
    }

    /// Parse a session id, returning `None` unless it is exactly 32 lowercase hex chars.
    pub fn parse(s: &str) -> Option<Self> {
        let well_formed = s.len() == TOKEN_BYTES * 2
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
            .ok_or_else(|| BridgeError::InvalidMessage(format!("malformed session id: {value:?}")))
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> String {
        id.0
    }
}
