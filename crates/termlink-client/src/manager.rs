//! Connection manager: drives the [`Machine`] against a real WebSocket.
//!
//! [`ConnectionManager::connect`] spawns a driver task and hands back a
//! cloneable [`BridgeHandle`]. The driver owns the socket, the reconnect
//! timer and the heartbeat; the handle only sends commands to it.

use crate::state::{Action, ConnectionState, Event, Machine};
use futures_util::{SinkExt, StreamExt};
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use termlink_core::{
    decode_server, encode, BridgeError, BridgeResult, ClientMessage, Clock, ReconnectPolicy, ServerMessage, SessionId,
    SystemClock, SESSION_QUERY_PARAM,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Opening = Pin<Box<dyn Future<Output = (u64, Result<Ws, WsError>)> + Send>>;

/// Options for [`ConnectionManager::connect`].
#[derive(Clone)]
pub struct ConnectOptions {
    /// Upgrade endpoint, e.g. `ws://127.0.0.1:7681/terminal`.
    pub url: String,
    pub reconnect: ReconnectPolicy,
    /// Ping period while connected. Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Hidden longer than this forces a reconnect when visible again.
    pub visibility_threshold: Duration,
    pub cols: u16,
    pub rows: u16,
    /// Session to reattach to on the first open.
    pub session: Option<SessionId>,
    pub clock: Arc<dyn Clock>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7681/terminal".into(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(25),
            visibility_threshold: Duration::from_secs(5),
            cols: 80,
            rows: 24,
            session: None,
            clock: Arc::new(SystemClock),
        }
    }
}

/// What subscribers see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A new shell is ready; run first-time setup. Not sent on reattach.
    Connected(SessionId),
    /// Output produced while no channel was attached, replayed on attach.
    Replay(String),
    /// Live output.
    Output(String),
    /// The shell exited; the session is gone.
    Exited(i32),
    /// The server refused the channel.
    ServerError(String),
}

#[derive(Debug)]
enum Command {
    Input(String),
    Command(String),
    Resize(u16, u16),
    Visible(bool),
    ForceReconnect,
    Close,
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<BridgeEvent>>>>;

/// Cloneable control surface for a running connection.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<Command>,
    subscribers: Subscribers,
    state: watch::Receiver<ConnectionState>,
    session: watch::Receiver<Option<SessionId>>,
}

impl BridgeHandle {
    /// Send raw keystrokes. Dropped while no socket is open.
    pub fn send_input(&self, data: impl Into<String>) -> BridgeResult<()> {
        self.command(Command::Input(data.into()))
    }

    /// Send a line; the server appends the Enter key.
    pub fn send_command(&self, data: impl Into<String>) -> BridgeResult<()> {
        self.command(Command::Command(data.into()))
    }

    /// Record the terminal size and send it if connected. The latest size
    /// is resent after every open.
    pub fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        self.command(Command::Resize(cols, rows))
    }

    pub fn set_visible(&self, visible: bool) -> BridgeResult<()> {
        self.command(Command::Visible(visible))
    }

    /// Drop the current socket and reconnect now, reusing the stored session.
    /// Also restarts a connection that stopped after the shell exited.
    pub fn force_reconnect(&self) -> BridgeResult<()> {
        self.command(Command::ForceReconnect)
    }

    /// Close for good. No further reconnects or heartbeats.
    pub fn close(&self) -> BridgeResult<()> {
        self.command(Command::Close)
    }

    /// A new receiver for events published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BridgeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// The session the next open will reattach to.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.borrow().clone()
    }

    fn command(&self, command: Command) -> BridgeResult<()> {
        self.commands
            .send(command)
            .map_err(|_| BridgeError::Transport("connection manager stopped".into()))
    }
}

struct Socket {
    attempt: u64,
    ws: Ws,
}

/// The driver task behind a [`BridgeHandle`].
pub struct ConnectionManager {
    options: ConnectOptions,
    machine: Machine,
    commands: mpsc::UnboundedReceiver<Command>,
    subscribers: Subscribers,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<Option<SessionId>>,
    size: (u16, u16),
    opening: Option<Opening>,
    socket: Option<Socket>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
}

impl ConnectionManager {
    /// Start connecting in the background.
    ///
    /// Returns the handle and a first event subscription, taken before the
    /// driver starts so no event is missed.
    pub fn connect(options: ConnectOptions) -> (BridgeHandle, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (session_tx, session_rx) = watch::channel(options.session.clone());
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

        let handle = BridgeHandle {
            commands: commands_tx,
            subscribers: subscribers.clone(),
            state: state_rx,
            session: session_rx,
        };
        let events = handle.subscribe();

        let manager = Self {
            machine: Machine::new(
                options.reconnect,
                options.visibility_threshold,
                options.session.clone(),
            ),
            size: (options.cols.max(1), options.rows.max(1)),
            options,
            commands: commands_rx,
            subscribers,
            state_tx,
            session_tx,
            opening: None,
            socket: None,
            reconnect_timer: None,
            heartbeat: None,
        };
        tokio::spawn(manager.run());

        (handle, events)
    }

    async fn run(mut self) {
        self.apply(Event::Start).await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("all handles dropped");
                        self.apply(Event::Close).await;
                    }
                },
                (attempt, result) = opened(&mut self.opening) => {
                    self.opening = None;
                    match result {
                        Ok(ws) => {
                            info!(attempt, "connected");
                            self.socket = Some(Socket { attempt, ws });
                            self.apply(Event::Opened { attempt }).await;
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "connect failed");
                            self.apply(Event::Lost { attempt }).await;
                        }
                    }
                }
                (attempt, frame) = next_frame(&mut self.socket) => self.on_frame(attempt, frame).await,
                _ = expired(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    self.apply(Event::ReconnectDue).await;
                }
                _ = tick(&mut self.heartbeat) => {
                    trace!("ping");
                    self.send(&ClientMessage::Ping).await;
                }
            }

            if self.machine.is_closed() {
                break;
            }
        }
        debug!("connection manager stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Input(data) => self.send(&ClientMessage::Input { data }).await,
            Command::Command(data) => self.send(&ClientMessage::Command { data }).await,
            Command::Resize(cols, rows) => {
                let size = (cols.max(1), rows.max(1));
                if size != self.size {
                    self.size = size;
                    self.send(&ClientMessage::Resize {
                        cols: size.0,
                        rows: size.1,
                    })
                    .await;
                }
            }
            Command::Visible(visible) => {
                let at = self.options.clock.now();
                let event = if visible {
                    Event::Visible { at }
                } else {
                    Event::Hidden { at }
                };
                self.apply(event).await;
            }
            Command::ForceReconnect => self.apply(Event::ForceReconnect).await,
            Command::Close => self.apply(Event::Close).await,
        }
    }

    async fn on_frame(&mut self, attempt: u64, frame: Option<Result<Message, WsError>>) {
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                info!(attempt, "connection closed");
                self.socket = None;
                self.apply(Event::Lost { attempt }).await;
                return;
            }
            Some(Err(e)) => {
                warn!(attempt, error = %e, "connection error");
                self.socket = None;
                self.apply(Event::Lost { attempt }).await;
                return;
            }
            Some(Ok(_)) => return,
        };

        match decode_server(text.as_str()) {
            Ok(ServerMessage::Session {
                session_id,
                buffered,
            }) => {
                debug!(session_id = %session_id.short(), replay_bytes = buffered.as_ref().map_or(0, String::len), "session frame");
                self.apply(Event::SessionAnnounced { attempt, session_id }).await;
                if let Some(replay) = buffered.filter(|b| !b.is_empty()) {
                    self.publish(BridgeEvent::Replay(replay));
                }
            }
            Ok(ServerMessage::Output { data }) => self.publish(BridgeEvent::Output(data)),
            Ok(ServerMessage::Exit { code }) => {
                info!(code, "session ended");
                self.publish(BridgeEvent::Exited(code));
                self.apply(Event::Exited { code }).await;
            }
            Ok(ServerMessage::Pong) => trace!("pong"),
            Ok(ServerMessage::Error { message }) => {
                warn!(%message, "server error");
                self.publish(BridgeEvent::ServerError(message));
            }
            Ok(ServerMessage::Unknown) => debug!("ignoring unknown frame type"),
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    async fn apply(&mut self, event: Event) {
        for action in self.machine.handle(event) {
            match action {
                Action::State(state) => {
                    debug!(?state, "state");
                    self.state_tx.send_replace(state);
                }
                Action::Open { attempt, session } => {
                    let url = attach_url(&self.options.url, session.as_ref());
                    info!(attempt, reattach = session.is_some(), "connecting");
                    self.socket = None;
                    self.opening = Some(Box::pin(async move {
                        (attempt, connect_async(url).await.map(|(ws, _)| ws))
                    }));
                }
                Action::TearDown => {
                    self.opening = None;
                    if let Some(mut socket) = self.socket.take() {
                        let _ = socket.ws.close(None).await;
                    }
                }
                Action::SendResize => {
                    let (cols, rows) = self.size;
                    self.send(&ClientMessage::Resize { cols, rows }).await;
                }
                Action::NotifyConnected(session_id) => {
                    info!(session_id = %session_id.short(), "new session");
                    self.publish(BridgeEvent::Connected(session_id));
                }
                Action::StoreSession(session) => {
                    self.session_tx.send_replace(session);
                }
                Action::ScheduleReconnect(delay) => {
                    info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
                    self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Action::CancelReconnect => self.reconnect_timer = None,
                Action::StartHeartbeat => {
                    let period = self.options.heartbeat_interval;
                    if !period.is_zero() {
                        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        self.heartbeat = Some(interval);
                    }
                }
                Action::StopHeartbeat => self.heartbeat = None,
            }
        }
    }

    /// Send on the open socket, if any. Failures surface as a close on the
    /// read side.
    async fn send(&mut self, msg: &ClientMessage) {
        let Some(socket) = self.socket.as_mut() else {
            debug!("not connected, dropping outbound frame");
            return;
        };
        match encode(msg) {
            Ok(text) => {
                if let Err(e) = socket.ws.send(Message::text(text)).await {
                    debug!(error = %e, "send failed");
                }
            }
            Err(e) => warn!(error = %e, "encode failed"),
        }
    }

    fn publish(&self, event: BridgeEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn lock(subscribers: &Subscribers) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<BridgeEvent>>> {
    subscribers.lock().unwrap_or_else(|p| p.into_inner())
}

/// `url` with the reattach parameter appended when there is a session.
pub fn attach_url(url: &str, session: Option<&SessionId>) -> String {
    match session {
        Some(id) => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{url}{sep}{SESSION_QUERY_PARAM}={id}")
        }
        None => url.to_string(),
    }
}

async fn opened(opening: &mut Option<Opening>) -> (u64, Result<Ws, WsError>) {
    match opening {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_frame(socket: &mut Option<Socket>) -> (u64, Option<Result<Message, WsError>>) {
    match socket {
        Some(socket) => (socket.attempt, socket.ws.next().await),
        None => pending().await,
    }
}

async fn expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termlink_core::decode_client;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    const WAIT: Duration = Duration::from_secs(5);

    struct MockConn {
        query: Option<String>,
        ws: WebSocketStream<TcpStream>,
    }

    impl MockConn {
        async fn send(&mut self, msg: ServerMessage) {
            self.ws.send(Message::text(encode(&msg).unwrap())).await.unwrap();
        }

        async fn recv(&mut self) -> Option<ClientMessage> {
            loop {
                match tokio::time::timeout(WAIT, self.ws.next()).await.ok()?? {
                    Ok(Message::Text(text)) => return Some(decode_client(text.as_str()).unwrap()),
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
        }

        /// Next frame that is not a ping.
        async fn recv_data(&mut self) -> Option<ClientMessage> {
            loop {
                match self.recv().await? {
                    ClientMessage::Ping => continue,
                    msg => return Some(msg),
                }
            }
        }
    }

    async fn mock_server() -> (String, mpsc::UnboundedReceiver<MockConn>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/terminal", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut query = None;
                let callback = |req: &Request, resp: Response| {
                    query = req.uri().query().map(str::to_owned);
                    Ok(resp)
                };
                if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                    let _ = tx.send(MockConn { query, ws });
                }
            }
        });
        (url, rx)
    }

    fn options(url: String) -> ConnectOptions {
        ConnectOptions {
            url,
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(20),
                ceiling: Duration::from_millis(200),
                factor: 2,
            },
            cols: 100,
            rows: 30,
            ..ConnectOptions::default()
        }
    }

    fn session_id() -> SessionId {
        SessionId::parse("00112233445566778899aabbccddeeff").unwrap()
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> BridgeEvent {
        tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    async fn wait_for_state(handle: &BridgeHandle, want: ConnectionState) {
        let mut state = handle.state();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == want))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn attach_url_appends_session() {
        let id = session_id();
        assert_eq!(attach_url("ws://h/terminal", None), "ws://h/terminal");
        assert_eq!(
            attach_url("ws://h/terminal", Some(&id)),
            format!("ws://h/terminal?sessionId={id}")
        );
        assert_eq!(
            attach_url("ws://h/terminal?x=1", Some(&id)),
            format!("ws://h/terminal?x=1&sessionId={id}")
        );
    }

    #[tokio::test]
    async fn fresh_connect_resizes_and_announces() {
        let (url, mut conns) = mock_server().await;
        let (handle, mut events) = ConnectionManager::connect(options(url));

        let mut conn = conns.recv().await.unwrap();
        assert!(conn.query.is_none());
        assert_eq!(conn.recv_data().await, Some(ClientMessage::Resize { cols: 100, rows: 30 }));

        conn.send(ServerMessage::Session {
            session_id: session_id(),
            buffered: Some("$ ".into()),
        })
        .await;
        assert_eq!(next_event(&mut events).await, BridgeEvent::Connected(session_id()));
        assert_eq!(next_event(&mut events).await, BridgeEvent::Replay("$ ".into()));
        wait_for_state(&handle, ConnectionState::Connected).await;
        assert_eq!(handle.session_id(), Some(session_id()));

        handle.send_command("ls").unwrap();
        handle.send_input("\x03").unwrap();
        assert_eq!(conn.recv_data().await, Some(ClientMessage::Command { data: "ls".into() }));
        assert_eq!(conn.recv_data().await, Some(ClientMessage::Input { data: "\x03".into() }));

        conn.send(ServerMessage::Output { data: "out".into() }).await;
        assert_eq!(next_event(&mut events).await, BridgeEvent::Output("out".into()));
    }

    #[tokio::test]
    async fn dropped_socket_reattaches_without_announcing() {
        let (url, mut conns) = mock_server().await;
        let (handle, mut events) = ConnectionManager::connect(options(url));

        let mut conn = conns.recv().await.unwrap();
        conn.send(ServerMessage::Session {
            session_id: session_id(),
            buffered: None,
        })
        .await;
        assert_eq!(next_event(&mut events).await, BridgeEvent::Connected(session_id()));
        drop(conn);

        let mut conn = tokio::time::timeout(WAIT, conns.recv()).await.unwrap().unwrap();
        assert_eq!(conn.query, Some(format!("sessionId={}", session_id())));
        assert_eq!(conn.recv_data().await, Some(ClientMessage::Resize { cols: 100, rows: 30 }));
        conn.send(ServerMessage::Session {
            session_id: session_id(),
            buffered: Some("missed".into()),
        })
        .await;
        // Only the replay: the shell is the same one.
        assert_eq!(next_event(&mut events).await, BridgeEvent::Replay("missed".into()));
        wait_for_state(&handle, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn exit_stops_reconnecting() {
        let (url, mut conns) = mock_server().await;
        let (handle, mut events) = ConnectionManager::connect(options(url));

        let mut conn = conns.recv().await.unwrap();
        conn.send(ServerMessage::Session {
            session_id: session_id(),
            buffered: None,
        })
        .await;
        next_event(&mut events).await;
        conn.send(ServerMessage::Exit { code: 7 }).await;
        assert_eq!(next_event(&mut events).await, BridgeEvent::Exited(7));
        drop(conn);

        wait_for_state(&handle, ConnectionState::Disconnected).await;
        assert!(handle.session_id().is_none());
        assert!(tokio::time::timeout(Duration::from_millis(500), conns.recv()).await.is_err());

        // Connecting again starts a fresh session.
        handle.force_reconnect().unwrap();
        let conn = tokio::time::timeout(WAIT, conns.recv()).await.unwrap().unwrap();
        assert!(conn.query.is_none());
    }

    #[tokio::test]
    async fn force_reconnect_replaces_the_socket() {
        let (url, mut conns) = mock_server().await;
        let (handle, mut events) = ConnectionManager::connect(options(url));

        let mut first = conns.recv().await.unwrap();
        first.send(ServerMessage::Session {
            session_id: session_id(),
            buffered: None,
        })
        .await;
        next_event(&mut events).await;
        wait_for_state(&handle, ConnectionState::Connected).await;

        handle.force_reconnect().unwrap();
        let second = tokio::time::timeout(WAIT, conns.recv()).await.unwrap().unwrap();
        assert_eq!(second.query, Some(format!("sessionId={}", session_id())));
        // The old socket was closed by the client.
        while first.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn close_is_final() {
        let (url, mut conns) = mock_server().await;
        let (handle, _events) = ConnectionManager::connect(options(url));
        let mut conn = conns.recv().await.unwrap();
        wait_for_state(&handle, ConnectionState::Connected).await;

        handle.close().unwrap();
        while conn.recv().await.is_some() {}
        wait_for_state(&handle, ConnectionState::Disconnected).await;
        assert!(tokio::time::timeout(Duration::from_millis(300), conns.recv()).await.is_err());

        // The driver is gone once the close is processed.
        let mut state = handle.state();
        assert!(tokio::time::timeout(WAIT, async {
            while state.changed().await.is_ok() {}
        })
        .await
        .is_ok());
        assert!(handle.send_input("x").is_err());
    }

    #[tokio::test]
    async fn heartbeat_pings_while_connected() {
        let (url, mut conns) = mock_server().await;
        let mut opts = options(url);
        opts.heartbeat_interval = Duration::from_millis(50);
        let (_handle, _events) = ConnectionManager::connect(opts);

        let mut conn = conns.recv().await.unwrap();
        let mut pings = 0;
        while pings < 3 {
            if conn.recv().await == Some(ClientMessage::Ping) {
                pings += 1;
            }
        }
    }
}
