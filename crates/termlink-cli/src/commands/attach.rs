//! `termlink attach [URL]`: attach the local terminal to a remote shell.
//!
//! Enters raw mode and pipes keystrokes and resizes to the session while
//! writing its output to stdout. The connection manager keeps the session
//! alive across network drops. Ctrl+] detaches and prints the session id so
//! the shell can be picked up again later with `--session`.

use anyhow::{Context, Result};
use crossterm::event::{self, Event};
use std::io::Write;
use std::time::Duration;
use termlink_client::{
    socket_addr, wait_for_server, BridgeEvent, ConnectOptions, ConnectionManager, ConnectionState,
};
use termlink_core::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::terminal as term;

/// Readiness polls made by `--wait`.
const WAIT_ATTEMPTS: u32 = 50;
const WAIT_INTERVAL: Duration = Duration::from_millis(200);
/// How often the input thread checks whether the session loop is gone.
const INPUT_POLL: Duration = Duration::from_millis(100);

enum Input {
    Data(String),
    Resize(u16, u16),
    Detach,
}

/// How an attach ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Detached(Option<SessionId>),
    Exited(i32),
}

/// Run an interactive session against `url`.
pub async fn run(url: &str, session: Option<&str>, wait: bool) -> Result<Outcome> {
    let session = session
        .map(|s| SessionId::parse(s).with_context(|| format!("invalid session id '{s}'")))
        .transpose()?;

    if wait {
        let addr = socket_addr(url)?;
        info!(addr = %addr, "waiting for server");
        wait_for_server(&addr, WAIT_ATTEMPTS, WAIT_INTERVAL)
            .await
            .with_context(|| format!("server at {addr} did not come up"))?;
    }

    let (cols, rows) = term::get_terminal_size();
    info!(url, cols, rows, reattach = session.is_some(), "attaching");

    let (handle, mut events) = ConnectionManager::connect(ConnectOptions {
        url: url.to_string(),
        cols,
        rows,
        session: session.clone(),
        ..Default::default()
    });
    let mut state = handle.state();
    let mut watching_state = true;
    let mut last_session = session;

    let _guard = term::RawModeGuard::enter().context("failed to enter raw terminal mode")?;

    let (tx_input, mut rx_input) = mpsc::channel::<Input>(64);
    let input_handle = tokio::task::spawn_blocking(move || read_terminal(tx_input));

    let mut stdout = std::io::stdout();
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BridgeEvent::Replay(text)) | Some(BridgeEvent::Output(text)) => {
                    stdout.write_all(text.as_bytes())?;
                    stdout.flush()?;
                }
                Some(BridgeEvent::Connected(id)) => {
                    debug!(session_id = %id.short(), "new session");
                    last_session = Some(id);
                }
                Some(BridgeEvent::Exited(code)) => break Outcome::Exited(code),
                Some(BridgeEvent::ServerError(message)) => {
                    write!(stdout, "\r\n\x1b[31m[termlink: {message}]\x1b[0m\r\n")?;
                    stdout.flush()?;
                }
                None => break Outcome::Detached(last_session.clone()),
            },
            input = rx_input.recv() => match input {
                Some(Input::Data(data)) => handle.send_input(data)?,
                Some(Input::Resize(cols, rows)) => handle.resize(cols, rows)?,
                Some(Input::Detach) | None => {
                    break Outcome::Detached(handle.session_id().or_else(|| last_session.clone()));
                }
            },
            changed = state.changed(), if watching_state => {
                if changed.is_err() {
                    watching_state = false;
                    continue;
                }
                let current = *state.borrow_and_update();
                if current == ConnectionState::Reconnecting {
                    write!(stdout, "\r\n\x1b[2m[termlink: connection lost, reconnecting]\x1b[0m\r\n")?;
                    stdout.flush()?;
                }
            }
        }
    };

    if let Err(e) = handle.close() {
        debug!(error = %e, "manager already stopped");
    }
    drop(rx_input);
    if let Err(e) = input_handle.await {
        warn!(error = %e, "input thread failed");
    }
    Ok(outcome)
}

/// Blocking crossterm loop; ends once the receiver is dropped.
fn read_terminal(tx: mpsc::Sender<Input>) {
    while !tx.is_closed() {
        match event::poll(INPUT_POLL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("crossterm poll error: {e}");
                break;
            }
        }
        let input = match event::read() {
            Ok(Event::Key(key)) if term::is_detach_key(&key) => Input::Detach,
            Ok(Event::Key(key)) => match term::key_event_to_input(&key) {
                Some(data) => Input::Data(data),
                None => continue,
            },
            Ok(Event::Paste(text)) => Input::Data(text),
            Ok(Event::Resize(cols, rows)) => Input::Resize(cols, rows),
            Ok(_) => continue,
            Err(e) => {
                warn!("crossterm event error: {e}");
                break;
            }
        };
        let detach = matches!(input, Input::Detach);
        if tx.blocking_send(input).is_err() || detach {
            break;
        }
    }
}
