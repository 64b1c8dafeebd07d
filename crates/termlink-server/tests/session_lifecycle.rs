//! End-to-end session behavior over a loopback WebSocket with `/bin/sh`.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use termlink_core::{decode_server, encode, ClientMessage, ServerMessage, SessionId};
use termlink_server::{ServerConfig, SessionRegistry, TermlinkServer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

struct TestServer {
    base: String,
    registry: Arc<dyn SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    done: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(max_sessions: usize) -> Self {
        Self::start_with(ServerConfig {
            shell: "/bin/sh".into(),
            cwd: None,
            max_sessions,
            grace_period: Duration::from_secs(30),
            ..ServerConfig::default()
        })
        .await
    }

    async fn start_with(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = TermlinkServer::new(config);
        let registry = server.registry().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let done = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });
        Self {
            base: format!("ws://{addr}/terminal"),
            registry,
            shutdown: Some(shutdown_tx),
            done,
        }
    }

    async fn connect(&self, session: Option<&SessionId>) -> Ws {
        let url = match session {
            Some(id) => format!("{}?sessionId={id}", self.base),
            None => self.base.clone(),
        };
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Don't leave shells behind when a test returns or panics.
        for host in self.registry.snapshot() {
            host.terminate();
        }
    }
}

async fn next_frame(ws: &mut Ws) -> Option<ServerMessage> {
    loop {
        let msg = tokio::time::timeout(FRAME_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")?;
        match msg {
            Ok(Message::Text(text)) => return Some(decode_server(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn expect_session(ws: &mut Ws) -> (SessionId, String) {
    match next_frame(ws).await {
        Some(ServerMessage::Session {
            session_id,
            buffered,
        }) => (session_id, buffered.unwrap_or_default()),
        other => panic!("expected session frame, got {other:?}"),
    }
}

async fn send(ws: &mut Ws, msg: ClientMessage) {
    ws.send(Message::text(encode(&msg).unwrap())).await.unwrap();
}

async fn command(ws: &mut Ws, line: &str) {
    send(ws, ClientMessage::Command { data: line.into() }).await;
}

/// Accumulate output text until it contains `needle`.
async fn read_until(ws: &mut Ws, mut seen: String, needle: &str) -> String {
    while !seen.contains(needle) {
        match next_frame(ws).await {
            Some(ServerMessage::Output { data }) => seen.push_str(&data),
            Some(_) => {}
            None => panic!("channel closed before {needle:?} appeared; saw {seen:?}"),
        }
    }
    seen
}

#[tokio::test]
async fn fresh_connection_runs_commands() {
    let server = TestServer::start(8).await;
    let mut ws = server.connect(None).await;
    let (id, _) = expect_session(&mut ws).await;
    assert_eq!(id.as_str().len(), 32);
    assert!(server.registry.lookup(&id).is_some());

    // The arithmetic keeps the echoed command line from matching.
    command(&mut ws, "echo fresh-$((40+2))").await;
    read_until(&mut ws, String::new(), "fresh-42").await;
}

#[tokio::test]
async fn reattach_replays_output_missed_while_detached() {
    let server = TestServer::start(8).await;
    let mut ws = server.connect(None).await;
    let (id, _) = expect_session(&mut ws).await;

    command(&mut ws, "sleep 0.3; echo missed-$((1+1))").await;
    drop(ws);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(server.registry.lookup(&id).is_some());

    let mut ws = server.connect(Some(&id)).await;
    let (again, buffered) = expect_session(&mut ws).await;
    assert_eq!(again, id);
    read_until(&mut ws, buffered, "missed-2").await;
}

#[tokio::test]
async fn output_arrives_in_write_order() {
    let server = TestServer::start(8).await;
    let mut ws = server.connect(None).await;
    expect_session(&mut ws).await;

    command(
        &mut ws,
        "i=0; while [ $i -lt 300 ]; do echo n$i; i=$((i+1)); done",
    )
    .await;
    let seen = read_until(&mut ws, String::new(), "n299\r\n").await;

    let numbers: Vec<u32> = seen
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix('n'))
        .filter_map(|n| n.parse().ok())
        .collect();
    assert_eq!(numbers, (0..300).collect::<Vec<u32>>());
}

#[tokio::test]
async fn exit_ends_the_session() {
    let server = TestServer::start(8).await;
    let mut ws = server.connect(None).await;
    let (id, _) = expect_session(&mut ws).await;

    command(&mut ws, "exit 3").await;
    let mut code = None;
    while let Some(frame) = next_frame(&mut ws).await {
        if let ServerMessage::Exit { code: c } = frame {
            code = Some(c);
        }
    }
    assert_eq!(code, Some(3));
    assert!(server.registry.lookup(&id).is_none());

    // The old id is gone, so a reattach attempt gets a fresh shell.
    let mut ws = server.connect(Some(&id)).await;
    let (fresh, _) = expect_session(&mut ws).await;
    assert_ne!(fresh, id);
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_ignored() {
    let server = TestServer::start(8).await;
    let mut ws = server.connect(None).await;
    expect_session(&mut ws).await;

    ws.send(Message::text(r#"{"type":"telemetry","x":1}"#)).await.unwrap();
    ws.send(Message::text("definitely not json")).await.unwrap();
    ws.send(Message::text(r#"{"type":"resize","cols":"wide"}"#)).await.unwrap();
    send(&mut ws, ClientMessage::Ping).await;

    loop {
        match next_frame(&mut ws).await {
            Some(ServerMessage::Pong) => break,
            Some(_) => continue,
            None => panic!("channel closed"),
        }
    }
}

#[tokio::test]
async fn silent_client_is_not_disconnected() {
    let server = TestServer::start(8).await;
    let mut ws = server.connect(None).await;
    expect_session(&mut ws).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    send(&mut ws, ClientMessage::Resize { cols: 100, rows: 30 }).await;
    command(&mut ws, "stty size").await;
    read_until(&mut ws, String::new(), "30 100").await;
}

#[tokio::test]
async fn second_attach_takes_over_the_session() {
    let server = TestServer::start(8).await;
    let mut first = server.connect(None).await;
    let (id, _) = expect_session(&mut first).await;

    let mut second = server.connect(Some(&id)).await;
    let (again, _) = expect_session(&mut second).await;
    assert_eq!(again, id);

    // The superseded channel is closed by the server.
    while next_frame(&mut first).await.is_some() {}

    command(&mut second, "echo still-$((2+2))").await;
    read_until(&mut second, String::new(), "still-4").await;
}

#[tokio::test]
async fn session_limit_yields_error_frame() {
    let server = TestServer::start(1).await;
    let mut first = server.connect(None).await;
    expect_session(&mut first).await;

    let mut second = server.connect(None).await;
    match next_frame(&mut second).await {
        Some(ServerMessage::Error { message }) => assert!(message.contains("limit")),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(next_frame(&mut second).await.is_none());
}

#[tokio::test]
async fn spawn_failure_sends_one_error_then_closes() {
    let server = TestServer::start_with(ServerConfig {
        shell: "/nonexistent/shell".into(),
        cwd: None,
        ..ServerConfig::default()
    })
    .await;
    let mut ws = server.connect(None).await;
    match next_frame(&mut ws).await {
        Some(ServerMessage::Error { message }) => assert!(message.contains("spawn failed"), "{message}"),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(next_frame(&mut ws).await.is_none());
    assert_eq!(server.registry.len(), 0);
}

#[tokio::test]
async fn other_paths_are_rejected() {
    let server = TestServer::start(8).await;
    let url = server.base.replace("/terminal", "/elsewhere");
    match connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn shutdown_kills_every_session() {
    let mut server = TestServer::start(8).await;
    let mut a = server.connect(None).await;
    expect_session(&mut a).await;
    let mut b = server.connect(None).await;
    expect_session(&mut b).await;
    assert_eq!(server.registry.len(), 2);

    server.shutdown.take().unwrap().send(()).unwrap();
    (&mut server.done).await.unwrap();

    for _ in 0..100 {
        if server.registry.len() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("sessions still registered after shutdown");
}
