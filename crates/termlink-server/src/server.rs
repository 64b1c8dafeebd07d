//! Core server: accepts upgraded connections and binds each one to a session.
//!
//! Owns the session registry and the shutdown broadcast. Every connection
//! either reattaches to the session named in its upgrade request or spawns a
//! fresh one, then relays frames between the socket and the PTY host until
//! one side goes away.

use crate::config::ServerConfig;
use crate::registry::{InMemoryRegistry, SessionRegistry};
use crate::session::PtyHost;
use crate::transport::websocket::{self, WebSocketConnection};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use termlink_core::{decode_client, encode, BridgeError, BridgeResult, ClientMessage, ServerMessage, SessionId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The termlink server instance.
pub struct TermlinkServer {
    config: ServerConfig,
    registry: Arc<dyn SessionRegistry>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl TermlinkServer {
    /// Create a server with an empty in-memory registry.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, Arc::new(InMemoryRegistry::new()))
    }

    pub fn with_registry(config: ServerConfig, registry: Arc<dyn SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> BridgeResult<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("failed to bind {addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until `shutdown`
    /// resolves, then kill every live session.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> BridgeResult<()> {
        let server = Arc::new(self);
        let local = listener.local_addr()?;
        let mut ws_rx = websocket::start_listener(listener, &server.config.path);

        info!(
            addr = %local,
            path = %server.config.path,
            max_sessions = server.config.max_sessions,
            grace_secs = server.config.grace_period.as_secs(),
            "termlink-server ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                conn = ws_rx.recv() => {
                    let Some(conn) = conn else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let srv = server.clone();
                    tokio::spawn(async move {
                        let remote = conn.remote_addr;
                        if let Err(e) = srv.handle_connection(conn).await {
                            warn!(remote = %remote, error = %e, "connection error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        let _ = server.shutdown_tx.send(());
        let hosts = server.registry.snapshot();
        info!(sessions = hosts.len(), "terminating sessions");
        for host in hosts {
            host.terminate();
        }
        Ok(())
    }

    async fn handle_connection(&self, conn: WebSocketConnection) -> BridgeResult<()> {
        let WebSocketConnection {
            ws_stream,
            remote_addr,
            requested_session,
        } = conn;
        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (host, generation) = match self.open_session(requested_session.as_ref(), tx) {
            Ok(bound) => bound,
            Err(e) => {
                warn!(remote = %remote_addr, error = %e, "could not open session");
                let frame = encode(&ServerMessage::Error {
                    message: e.to_string(),
                })?;
                let _ = sink.send(Message::text(frame)).await;
                let _ = sink.close().await;
                return Ok(());
            }
        };
        info!(remote = %remote_addr, session_id = %host.id().short(), generation, "channel open");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let result = async {
            loop {
                tokio::select! {
                    outbound = rx.recv() => match outbound {
                        Some(msg) => {
                            sink.send(Message::text(encode(&msg)?))
                                .await
                                .map_err(|e| BridgeError::Transport(e.to_string()))?;
                        }
                        None => {
                            // Superseded by a newer channel, or the process exited.
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            handle_frame(&host, text.as_str(), &mut sink).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(remote = %remote_addr, "peer closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(remote = %remote_addr, error = %e, "socket error");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
            Ok::<(), BridgeError>(())
        }
        .await;

        host.detach(generation);
        debug!(remote = %remote_addr, session_id = %host.id().short(), "channel closed");
        result
    }

    /// Reattach to `requested` if it is still alive, otherwise spawn a fresh
    /// session. Either way `tx` ends up bound to the returned host.
    fn open_session(
        &self,
        requested: Option<&SessionId>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> BridgeResult<(Arc<PtyHost>, u64)> {
        if let Some(id) = requested {
            match self.registry.lookup(id) {
                Some(host) => match host.attach(tx.clone()) {
                    Ok(generation) => return Ok((host, generation)),
                    Err(BridgeError::SessionEnded(reason)) => {
                        debug!(session_id = %id.short(), reason = %reason, "requested session ended, spawning fresh");
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    info!(session_id = %id.short(), "requested session not found, spawning fresh");
                }
            }
        }

        let live = self.registry.len();
        if live >= self.config.max_sessions {
            return Err(BridgeError::Limit(format!(
                "session limit of {} reached",
                self.config.max_sessions
            )));
        }

        let host = PtyHost::spawn(
            &self.config.spawn_spec(),
            self.registry.clone(),
            self.config.host_options(),
        )?;
        let generation = host.attach(tx)?;
        Ok((host, generation))
    }
}

/// Apply one inbound text frame. Malformed frames are logged and dropped.
async fn handle_frame(host: &PtyHost, text: &str, sink: &mut WsSink) -> BridgeResult<()> {
    let msg = match decode_client(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(session_id = %host.id().short(), error = %e, "dropping malformed frame");
            return Ok(());
        }
    };

    match msg {
        ClientMessage::Ping => {
            trace!(session_id = %host.id().short(), "ping");
            sink.send(Message::text(encode(&ServerMessage::Pong)?))
                .await
                .map_err(|e| BridgeError::Transport(e.to_string()))?;
        }
        ClientMessage::Resize { cols, rows } => match host.resize(cols, rows) {
            Ok(true) => debug!(session_id = %host.id().short(), cols, rows, "resized"),
            Ok(false) => {}
            Err(e) => warn!(session_id = %host.id().short(), error = %e, "resize failed"),
        },
        ClientMessage::Input { .. } | ClientMessage::Command { .. } => {
            if let Some(data) = msg.pty_input() {
                if let Err(e) = host.write(data.as_bytes()) {
                    warn!(session_id = %host.id().short(), error = %e, "input dropped");
                }
            }
        }
        ClientMessage::Unknown => {
            debug!(session_id = %host.id().short(), "ignoring unknown frame type");
        }
    }
    Ok(())
}
