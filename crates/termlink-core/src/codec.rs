//! JSON text framing for terminal channels.
//!
//! One WebSocket text message carries exactly one JSON object.

use crate::error::{BridgeError, BridgeResult};
use crate::messages::{ClientMessage, ServerMessage};
use serde::Serialize;

/// Encode a message into a single JSON text frame.
pub fn encode<T: Serialize>(value: &T) -> BridgeResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a client→server frame.
///
/// Unknown `type` values decode as [`ClientMessage::Unknown`]; a frame that is
/// not a JSON object with a `type` string is an error.
pub fn decode_client(text: &str) -> BridgeResult<ClientMessage> {
    serde_json::from_str(text).map_err(|e| BridgeError::InvalidMessage(e.to_string()))
}

/// Decode a server→client frame.
pub fn decode_server(text: &str) -> BridgeResult<ServerMessage> {
    serde_json::from_str(text).map_err(|e| BridgeError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_client_type() {
        assert_eq!(
            decode_client(r#"{"type":"input","data":"a"}"#).unwrap(),
            ClientMessage::Input { data: "a".into() }
        );
        assert_eq!(
            decode_client(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap(),
            ClientMessage::Resize {
                cols: 120,
                rows: 40
            }
        );
        assert_eq!(
            decode_client(r#"{"type":"command","data":"pwd"}"#).unwrap(),
            ClientMessage::Command { data: "pwd".into() }
        );
        assert_eq!(decode_client(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let msg = decode_client(r#"{"type":"telepathy","data":1}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown);
        let msg = decode_server(r#"{"type":"motd","text":"hi"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(decode_client("not json").is_err());
        assert!(decode_client(r#"{"data":"no type"}"#).is_err());
        assert!(decode_client(r#"{"type":"resize","cols":"wide"}"#).is_err());
    }

    #[test]
    fn server_frames_decode() {
        let json = r#"{"type":"session","sessionId":"ffffffffffffffffffffffffffffffff","buffered":"$ "}"#;
        match decode_server(json).unwrap() {
            ServerMessage::Session {
                session_id,
                buffered,
            } => {
                assert_eq!(session_id.as_str(), "ffffffffffffffffffffffffffffffff");
                assert_eq!(buffered.as_deref(), Some("$ "));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            decode_server(r#"{"type":"exit","code":0}"#).unwrap(),
            ServerMessage::Exit { code: 0 }
        );
        assert_eq!(decode_server(r#"{"type":"pong"}"#).unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn encoded_frames_carry_type_tag() {
        let text = encode(&ClientMessage::Ping).unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
        let text = encode(&ServerMessage::Output { data: "x".into() }).unwrap();
        assert_eq!(text, r#"{"type":"output","data":"x"}"#);
    }
}
