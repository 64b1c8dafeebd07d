//! PTY host: one running terminal process and its attachment lifecycle.
//!
//! A host buffers output from the moment it is spawned. At most one channel
//! is attached at a time; attaching drains the buffer into the session frame
//! before any live output is forwarded. Detaching arms a grace timer that
//! kills the process unless another attach arrives first. Process exit sends
//! an exit frame and evicts the session immediately.

use super::pty::{PtyHandle, PtyProcess, SpawnSpec, SpawnedPty};
use super::ring_buffer::RingBuffer;
use crate::registry::SessionRegistry;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use termlink_core::utf8::trim_partial_prefix;
use termlink_core::{BridgeError, BridgeResult, ServerMessage, SessionId, Utf8Decoder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to keep draining output after the process has exited.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// Sender half of an attached channel's outbound queue.
pub type ChannelSender = mpsc::UnboundedSender<ServerMessage>;

/// Host-level settings shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct HostOptions {
    /// How long a detached process is kept alive.
    pub grace_period: Duration,
    /// Capacity of the detached-output ring.
    pub ring_buffer_size: usize,
}

struct AttachedChannel {
    generation: u64,
    tx: ChannelSender,
    /// Holds back an incomplete UTF-8 tail between live chunks.
    decoder: Utf8Decoder,
}

struct HostState {
    channel: Option<AttachedChannel>,
    pending: RingBuffer,
    /// Bumped on every attach; stale detaches and timers compare against it.
    generation: u64,
    grace_timer: Option<JoinHandle<()>>,
    size: (u16, u16),
    exit_code: Option<i32>,
}

impl HostState {
    /// Unbind the current channel, returning any held-back bytes to the ring.
    fn unbind(&mut self) -> Option<AttachedChannel> {
        let mut channel = self.channel.take()?;
        let tail = channel.decoder.take_pending();
        self.pending.write(&tail);
        Some(channel)
    }

    fn cancel_grace_timer(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }
}

/// One pseudo-terminal session.
pub struct PtyHost {
    id: SessionId,
    process: Box<dyn PtyProcess>,
    registry: Arc<dyn SessionRegistry>,
    options: HostOptions,
    created_at: Instant,
    state: Mutex<HostState>,
}

impl PtyHost {
    /// Spawn a process, register it, and start buffering its output.
    pub fn spawn(
        spec: &SpawnSpec,
        registry: Arc<dyn SessionRegistry>,
        options: HostOptions,
    ) -> BridgeResult<Arc<Self>> {
        let spawned = PtyHandle::spawn(spec)?;
        Self::start(spawned, (spec.cols, spec.rows), registry, options)
    }

    /// Register an already running process under a fresh id and start its
    /// output pump.
    pub fn start(
        spawned: SpawnedPty,
        size: (u16, u16),
        registry: Arc<dyn SessionRegistry>,
        options: HostOptions,
    ) -> BridgeResult<Arc<Self>> {
        let SpawnedPty {
            process,
            output,
            exit,
        } = spawned;

        let host = Arc::new(Self {
            id: SessionId::generate(),
            process,
            registry: registry.clone(),
            options,
            created_at: Instant::now(),
            state: Mutex::new(HostState {
                channel: None,
                pending: RingBuffer::new(options.ring_buffer_size),
                generation: 0,
                grace_timer: None,
                size,
                exit_code: None,
            }),
        });

        if let Err(e) = registry.register(host.clone()) {
            let _ = host.process.kill();
            return Err(e);
        }

        tokio::spawn(host.clone().pump(output, exit));
        info!(session_id = %host.id, "session started");
        Ok(host)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_attached(&self) -> bool {
        self.lock().channel.is_some()
    }

    pub fn size(&self) -> (u16, u16) {
        self.lock().size
    }

    /// Bind `tx` as the session's channel.
    ///
    /// Sends the session frame, carrying everything buffered since the last
    /// attach, as the first message on `tx`. A channel that is still bound
    /// (its connection not yet seen closing) is superseded. Returns the
    /// generation to pass to [`detach`](Self::detach).
    pub fn attach(self: &Arc<Self>, tx: ChannelSender) -> BridgeResult<u64> {
        let mut state = self.lock();
        if let Some(code) = state.exit_code {
            return Err(BridgeError::SessionEnded(format!(
                "{} exited with code {code}",
                self.id
            )));
        }

        if let Some(old) = state.unbind() {
            info!(session_id = %self.id, generation = old.generation, "superseding attached channel");
        }
        state.cancel_grace_timer();
        state.generation += 1;
        let generation = state.generation;

        let overflowed = state.pending.overflowed();
        if overflowed > 0 {
            warn!(session_id = %self.id, dropped_bytes = overflowed, "replay buffer overflowed while detached");
        }
        let replay = state.pending.drain();
        let mut decoder = Utf8Decoder::new();
        let buffered = decoder.decode(trim_partial_prefix(&replay));

        let frame = ServerMessage::Session {
            session_id: self.id.clone(),
            buffered: (!buffered.is_empty()).then_some(buffered),
        };
        if tx.send(frame).is_err() {
            // Nobody will see the replay; keep it for the next attach.
            state.pending.write(&replay);
            self.arm_grace_timer(&mut state);
            return Err(BridgeError::Transport("channel closed during attach".into()));
        }

        state.channel = Some(AttachedChannel {
            generation,
            tx,
            decoder,
        });
        info!(session_id = %self.id, generation, replay_bytes = replay.len(), "channel attached");
        Ok(generation)
    }

    /// Unbind the channel attached as `generation` and start the grace timer.
    ///
    /// No-op if that channel was already superseded or the process exited.
    pub fn detach(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.channel.as_ref().map(|c| c.generation) != Some(generation) {
            debug!(session_id = %self.id, generation, "detach of stale channel ignored");
            return;
        }
        state.unbind();
        self.arm_grace_timer(&mut state);
        info!(session_id = %self.id, generation, grace_secs = self.options.grace_period.as_secs(), "channel detached");
    }

    /// Forward input to the process.
    pub fn write(&self, data: &[u8]) -> BridgeResult<()> {
        if self.lock().exit_code.is_some() {
            return Err(BridgeError::SessionEnded(self.id.to_string()));
        }
        self.process.write(data)
    }

    /// Resize the PTY. Returns `false` when the size is unchanged and
    /// nothing was done.
    pub fn resize(&self, cols: u16, rows: u16) -> BridgeResult<bool> {
        let size = (cols.max(1), rows.max(1));
        let mut state = self.lock();
        if state.size == size {
            return Ok(false);
        }
        self.process.resize(size.0, size.1)?;
        state.size = size;
        Ok(true)
    }

    /// Kill the process now (server shutdown).
    pub fn terminate(&self) {
        let mut state = self.lock();
        state.cancel_grace_timer();
        if state.exit_code.is_none() {
            if let Err(e) = self.process.kill() {
                debug!(session_id = %self.id, error = %e, "kill failed");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn arm_grace_timer(self: &Arc<Self>, state: &mut HostState) {
        state.cancel_grace_timer();
        let host = Arc::clone(self);
        let generation = state.generation;
        let grace = self.options.grace_period;
        state.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            host.expire(generation);
        }));
    }

    /// Grace period elapsed: kill and evict unless reattached meanwhile.
    fn expire(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.channel.is_some() || state.generation != generation || state.exit_code.is_some() {
                return;
            }
            state.grace_timer = None;
        }
        info!(session_id = %self.id, "grace period expired, killing orphaned process");
        if let Err(e) = self.process.kill() {
            warn!(session_id = %self.id, error = %e, "failed to kill orphaned process");
        }
        self.registry.evict(&self.id);
    }

    /// Route one chunk of output to the attached channel or the ring.
    fn route_output(self: &Arc<Self>, chunk: &[u8]) {
        let mut state = self.lock();
        let Some(channel) = state.channel.as_mut() else {
            state.pending.write(chunk);
            return;
        };

        let data = channel.decoder.decode(chunk);
        if data.is_empty() {
            return;
        }
        if let Err(mpsc::error::SendError(ServerMessage::Output { data })) =
            channel.tx.send(ServerMessage::Output { data })
        {
            // The connection went away without detaching yet.
            let generation = channel.generation;
            state.pending.write(data.as_bytes());
            state.unbind();
            self.arm_grace_timer(&mut state);
            debug!(session_id = %self.id, generation, "channel gone, buffering output");
        }
    }

    async fn pump(self: Arc<Self>, mut output: mpsc::Receiver<Vec<u8>>, mut exit: oneshot::Receiver<i32>) {
        let code = loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(chunk) => self.route_output(&chunk),
                    None => break (&mut exit).await.unwrap_or(-1),
                },
                code = &mut exit => {
                    // Pick up whatever the process wrote just before exiting.
                    while let Ok(Some(chunk)) = tokio::time::timeout(EXIT_DRAIN, output.recv()).await {
                        self.route_output(&chunk);
                    }
                    break code.unwrap_or(-1);
                }
            }
        };
        self.finish(code);
    }

    /// Process exited: flush, send the exit frame, evict immediately.
    fn finish(&self, code: i32) {
        {
            let mut state = self.lock();
            state.exit_code = Some(code);
            state.cancel_grace_timer();
            if let Some(mut channel) = state.channel.take() {
                let tail = channel.decoder.finish();
                if !tail.is_empty() {
                    let _ = channel.tx.send(ServerMessage::Output { data: tail });
                }
                let _ = channel.tx.send(ServerMessage::Exit { code });
                // Dropping the sender ends the connection after the exit frame.
            }
        }
        self.registry.evict(&self.id);
        info!(session_id = %self.id, code, "session ended");
    }
}
