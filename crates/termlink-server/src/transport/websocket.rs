//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts upgrades on a single endpoint path. The optional `sessionId`
//! query parameter of the upgrade request is captured during the handshake
//! and handed to the server alongside the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use termlink_core::{SessionId, SESSION_QUERY_PARAM};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Session the client asked to reattach to, if it sent a well-formed id.
    pub requested_session: Option<SessionId>,
}

/// Start accepting upgrades on `listener` for requests to `path`.
///
/// Returns a receiver that yields accepted connections.
pub fn start_listener(listener: TcpListener, path: &str) -> mpsc::Receiver<WebSocketConnection> {
    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);
    let path: Arc<str> = Arc::from(path);

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, path = %path, "WebSocket listener started");
    }

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        let mut query: Option<String> = None;
                        let callback = |req: &Request, resp: Response| {
                            if req.uri().path() != &*path {
                                let mut not_found = ErrorResponse::new(Some("not found".into()));
                                *not_found.status_mut() = StatusCode::NOT_FOUND;
                                return Err(not_found);
                            }
                            query = req.uri().query().map(str::to_owned);
                            Ok(resp)
                        };
                        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                            Ok(ws_stream) => {
                                let requested_session = session_from_query(query.as_deref());
                                debug!(remote = %addr, reattach = requested_session.is_some(), "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    requested_session,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    rx
}

/// Extract the reattach session id from an upgrade request's query string.
///
/// A missing or malformed id means "start a fresh session".
pub fn session_from_query(query: Option<&str>) -> Option<SessionId> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == SESSION_QUERY_PARAM)
        .and_then(|(_, value)| SessionId::parse(value))
}
