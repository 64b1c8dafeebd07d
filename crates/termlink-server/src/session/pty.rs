//! PTY process wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running the configured command and exposes it as
//! three independent pieces: a [`PtyProcess`] for input/resize/kill, a
//! channel of output chunks fed by a reader thread, and a oneshot carrying
//! the exit code.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use termlink_core::{BridgeError, BridgeResult};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Size of a single PTY read.
const READ_CHUNK: usize = 8 * 1024;

/// Output chunks in flight between the reader thread and the session pump.
const OUTPUT_QUEUE: usize = 256;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Command line; the first word is the program.
    pub command: String,
    /// Working directory (inherited when `None`).
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    /// Value for `TERM`.
    pub term: String,
}

/// Control surface of a running terminal process.
///
/// Implemented by [`PtyHandle`] for real pseudo-terminals; tests substitute
/// an in-memory process.
pub trait PtyProcess: Send + Sync {
    /// Queue bytes for the process's stdin. Writes are delivered in call order.
    fn write(&self, data: &[u8]) -> BridgeResult<()>;

    fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()>;

    fn kill(&self) -> BridgeResult<()>;
}

/// A freshly started process and the streams it produces.
pub struct SpawnedPty {
    pub process: Box<dyn PtyProcess>,
    /// Output chunks in the order the process wrote them; closes at EOF.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Exit code once the process terminates.
    pub exit: oneshot::Receiver<i32>,
}

/// A real pseudo-terminal.
pub struct PtyHandle {
    /// Feeds the writer thread; ordering is preserved by the single consumer.
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// The master for resize operations (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyHandle {
    /// Spawn `spec.command` on a new PTY.
    pub fn spawn(spec: &SpawnSpec) -> BridgeResult<SpawnedPty> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: spec.rows.max(1),
            cols: spec.cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| BridgeError::Spawn(format!("failed to open PTY: {e}")))?;

        let parts: Vec<&str> = spec.command.split_whitespace().collect();
        let Some((program, args)) = parts.split_first() else {
            return Err(BridgeError::Spawn("empty command".into()));
        };
        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", &spec.term);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BridgeError::Spawn(format!("failed to spawn {program}: {e}")))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        info!(command = %spec.command, cols = size.cols, rows = size.rows, "PTY spawned");

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| BridgeError::Pty(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE);
        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // EIO is how Linux reports hangup on the master side.
                            debug!(error = %e, "PTY read ended");
                            break;
                        }
                    }
                }
            })?;

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        std::thread::Builder::new()
            .name("pty-writer".into())
            .spawn(move || {
                while let Some(data) = input_rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                        warn!(error = %e, "PTY write failed");
                        break;
                    }
                }
            })?;

        let (exit_tx, exit_rx) = oneshot::channel();
        // Reaped off the runtime so shutdown never waits on a live shell.
        std::thread::Builder::new()
            .name("pty-waiter".into())
            .spawn(move || {
                let code: i32 = match child.wait() {
                    Ok(status) => status.exit_code().try_into().unwrap_or(-1),
                    Err(e) => {
                        warn!(error = %e, "wait on PTY child failed");
                        -1
                    }
                };
                info!(code, "PTY child exited");
                let _ = exit_tx.send(code);
            })?;

        let handle = PtyHandle {
            input_tx,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
        };

        Ok(SpawnedPty {
            process: Box::new(handle),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

impl PtyProcess for PtyHandle {
    fn write(&self, data: &[u8]) -> BridgeResult<()> {
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| BridgeError::Pty("PTY input closed".into()))
    }

    fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| BridgeError::Pty("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| BridgeError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&self) -> BridgeResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| BridgeError::Pty("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| BridgeError::Pty(format!("kill failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(command: &str) -> SpawnSpec {
        SpawnSpec {
            command: command.into(),
            cwd: None,
            cols: 80,
            rows: 24,
            term: "xterm-256color".into(),
        }
    }

    async fn collect_output(spawned: &mut SpawnedPty) -> String {
        let mut out = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_secs(5), spawned.output.recv()).await
        {
            out.extend(chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = PtyHandle::spawn(&spec("   ")).err().unwrap();
        assert!(matches!(err, BridgeError::Spawn(_)));
    }

    #[tokio::test]
    async fn output_and_exit_code_are_reported() {
        let mut spawned = PtyHandle::spawn(&spec("/bin/false")).unwrap();
        let _ = collect_output(&mut spawned).await;
        let code = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn input_reaches_the_process() {
        let mut spawned = PtyHandle::spawn(&spec("/bin/cat")).unwrap();
        spawned.process.write(b"ping-from-test\n").unwrap();
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("ping-from-test") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), spawned.output.recv())
                .await
                .unwrap()
                .unwrap();
            seen.extend(chunk);
        }
        spawned.process.kill().unwrap();
    }

    #[test]
    fn live_shell_does_not_block_runtime_shutdown() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let spawned = runtime.block_on(async { PtyHandle::spawn(&spec("/bin/cat")).unwrap() });
            drop(runtime);
            let _ = done_tx.send(spawned);
        });
        let spawned = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("runtime drop waited on the shell");
        spawned.process.kill().unwrap();
    }
}
