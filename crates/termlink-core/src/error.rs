use thiserror::Error;

/// Errors produced by the termlink bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("session ended: {0}")]
    SessionEnded(String),

    #[error("session id already registered: {0}")]
    AlreadyRegistered(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("limit reached: {0}")]
    Limit(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Codec(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
