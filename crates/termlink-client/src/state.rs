//! Reconnection state machine.
//!
//! Pure: [`Machine::handle`] maps `(state, event, now)` to a list of
//! [`Action`]s for the driver to perform, so every transition can be tested
//! without sockets or timers. Socket-level events carry the attempt number
//! they belong to; events from a torn-down attempt are ignored, which also
//! collapses an error followed by a close into a single loss.

use std::time::{Duration, Instant};
use termlink_core::{Backoff, ReconnectPolicy, SessionId};

/// Connection lifecycle as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Consumer wants a connection (first connect, or again after an exit).
    Start,
    /// The socket for `attempt` finished its handshake.
    Opened { attempt: u64 },
    /// The server's session frame arrived on `attempt`.
    SessionAnnounced { attempt: u64, session_id: SessionId },
    /// The socket for `attempt` closed, errored, or failed to open.
    Lost { attempt: u64 },
    /// The backoff timer elapsed.
    ReconnectDue,
    /// The page went to the background.
    Hidden { at: Instant },
    /// The page came back to the foreground.
    Visible { at: Instant },
    /// Consumer asked to drop the socket and reconnect now.
    ForceReconnect,
    /// The shell exited.
    Exited { code: i32 },
    /// Consumer is done with the connection.
    Close,
}

/// Side effects requested by the machine, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Publish a state change.
    State(ConnectionState),
    /// Open a socket, reattaching to `session` if set.
    Open {
        attempt: u64,
        session: Option<SessionId>,
    },
    /// Close the current socket (and abandon one still opening).
    TearDown,
    /// Send the current terminal size.
    SendResize,
    /// Tell the consumer a new shell is ready for first-time setup.
    NotifyConnected(SessionId),
    /// Remember (or forget) the session to reattach to.
    StoreSession(Option<SessionId>),
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartHeartbeat,
    StopHeartbeat,
}

/// The reconnection policy and everything it tracks.
#[derive(Debug)]
pub struct Machine {
    state: ConnectionState,
    session: Option<SessionId>,
    backoff: Backoff,
    /// Number of the most recent open; earlier attempts are stale.
    attempt: u64,
    /// Whether the current attempt is still in flight or open.
    live: bool,
    /// Set before deliberate teardown; suppresses all reconnection.
    intentional_close: bool,
    /// The shell exited; wait for an explicit start before reconnecting.
    ended: bool,
    hidden_since: Option<Instant>,
    visibility_threshold: Duration,
}

impl Machine {
    pub fn new(policy: ReconnectPolicy, visibility_threshold: Duration, session: Option<SessionId>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            session,
            backoff: Backoff::new(policy),
            attempt: 0,
            live: false,
            intentional_close: false,
            ended: false,
            hidden_since: None,
            visibility_threshold,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn is_closed(&self) -> bool {
        self.intentional_close
    }

    /// Delay the next scheduled reconnect would use.
    pub fn current_delay(&self) -> Duration {
        self.backoff.current_delay()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.intentional_close {
            return Vec::new();
        }
        match event {
            Event::Start => {
                self.ended = false;
                self.backoff.reset();
                self.reopen()
            }
            Event::Opened { attempt } => {
                if !self.is_current(attempt) {
                    return Vec::new();
                }
                self.backoff.reset();
                self.state = ConnectionState::Connected;
                vec![
                    Action::State(ConnectionState::Connected),
                    Action::SendResize,
                    Action::StartHeartbeat,
                ]
            }
            Event::SessionAnnounced { attempt, session_id } => {
                if !self.is_current(attempt) || self.session.as_ref() == Some(&session_id) {
                    return Vec::new();
                }
                // No stored id, or the stored one was gone and the server
                // spawned a fresh shell: either way this shell is new.
                self.session = Some(session_id.clone());
                vec![
                    Action::StoreSession(Some(session_id.clone())),
                    Action::NotifyConnected(session_id),
                ]
            }
            Event::Lost { attempt } => {
                if !self.is_current(attempt) {
                    return Vec::new();
                }
                self.live = false;
                let mut actions = vec![Action::StopHeartbeat];
                self.state = ConnectionState::Disconnected;
                actions.push(Action::State(ConnectionState::Disconnected));
                if !self.ended {
                    let delay = self.backoff.next_delay();
                    self.state = ConnectionState::Reconnecting;
                    actions.push(Action::ScheduleReconnect(delay));
                    actions.push(Action::State(ConnectionState::Reconnecting));
                }
                actions
            }
            Event::ReconnectDue => {
                if self.state != ConnectionState::Reconnecting || self.ended {
                    return Vec::new();
                }
                self.reopen()
            }
            Event::Hidden { at } => {
                self.hidden_since.get_or_insert(at);
                Vec::new()
            }
            Event::Visible { at } => {
                let hidden_for = self
                    .hidden_since
                    .take()
                    .map(|since| at.saturating_duration_since(since))
                    .unwrap_or_default();
                let socket_open = self.state == ConnectionState::Connected;
                if self.ended || (socket_open && hidden_for <= self.visibility_threshold) {
                    return Vec::new();
                }
                self.force_reconnect()
            }
            Event::ForceReconnect => {
                self.ended = false;
                self.force_reconnect()
            }
            Event::Exited { .. } => {
                self.ended = true;
                self.session = None;
                self.state = ConnectionState::Disconnected;
                vec![
                    Action::StoreSession(None),
                    Action::StopHeartbeat,
                    Action::CancelReconnect,
                    Action::State(ConnectionState::Disconnected),
                ]
            }
            Event::Close => {
                self.intentional_close = true;
                self.live = false;
                self.state = ConnectionState::Disconnected;
                vec![
                    Action::CancelReconnect,
                    Action::StopHeartbeat,
                    Action::TearDown,
                    Action::State(ConnectionState::Disconnected),
                ]
            }
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.live && attempt == self.attempt
    }

    /// Tear down whatever is there and open immediately, ignoring backoff.
    fn force_reconnect(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::CancelReconnect];
        if self.live {
            actions.push(Action::StopHeartbeat);
            actions.push(Action::TearDown);
        }
        actions.extend(self.reopen());
        actions
    }

    fn reopen(&mut self) -> Vec<Action> {
        self.attempt += 1;
        self.live = true;
        self.state = ConnectionState::Connecting;
        vec![
            Action::State(ConnectionState::Connecting),
            Action::Open {
                attempt: self.attempt,
                session: self.session.clone(),
            },
        ]
    }
}
