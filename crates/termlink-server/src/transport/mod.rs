//! Network listeners.

pub mod websocket;
