//! Session management: PTY process, host lifecycle, replay buffer.

pub mod host;
pub mod pty;
pub mod ring_buffer;

pub use host::{ChannelSender, HostOptions, PtyHost};
pub use pty::{PtyHandle, PtyProcess, SpawnSpec, SpawnedPty};
pub use ring_buffer::RingBuffer;
