//! Output renderer: writes bridge events into a terminal surface.
//!
//! Events arrive in channel order, so a session's replay is always written
//! in one piece before any live output that followed it.
//!
//! Some surfaces jump the viewport to the top of history when a large write
//! lands while the user is scrolled back. The renderer snapshots the scroll
//! position before each write; if it was somewhere in the middle and the
//! write left it at the very top, the old position is restored on the next
//! frame. This can misfire when output legitimately scrolls to the top right
//! after a reattach.

use crate::gesture::ScrollTarget;
use crate::manager::BridgeEvent;
use tracing::debug;

/// Rows of history kept by [`Vt100Surface`].
pub const DEFAULT_SCROLLBACK: usize = 10_000;

/// Something that displays terminal output and can scroll through history.
///
/// Scroll positions count lines from the top of history: `0` is the oldest
/// line, [`scroll_max`](Self::scroll_max) is the live bottom.
pub trait TerminalSurface {
    fn write(&mut self, text: &str);

    fn scroll_position(&mut self) -> usize;

    fn scroll_max(&mut self) -> usize;

    fn set_scroll_position(&mut self, position: usize);
}

/// Feeds [`BridgeEvent`]s into a [`TerminalSurface`].
pub struct OutputRenderer<S> {
    surface: S,
    /// Position to restore on the next frame.
    pending_restore: Option<usize>,
}

impl<S: TerminalSurface> OutputRenderer<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            pending_restore: None,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }

    pub fn handle(&mut self, event: &BridgeEvent) {
        match event {
            BridgeEvent::Replay(text) => {
                debug!(bytes = text.len(), "writing replay");
                self.write(text);
            }
            BridgeEvent::Output(text) => self.write(text),
            BridgeEvent::Exited(code) => {
                self.write(&format!("\r\n\x1b[2m[session ended with code {code}]\x1b[0m\r\n"));
            }
            BridgeEvent::ServerError(message) => {
                self.write(&format!("\r\n\x1b[31m[{message}]\x1b[0m\r\n"));
            }
            BridgeEvent::Connected(_) => {}
        }
    }

    /// Write output, applying the scroll correction.
    pub fn write(&mut self, text: &str) {
        self.on_frame();

        let max = self.surface.scroll_max();
        let before = self.surface.scroll_position();
        self.surface.write(text);
        let after = self.surface.scroll_position();

        if before != 0 && before < max && after == 0 {
            debug!(before, "viewport jumped to top, restoring next frame");
            self.pending_restore = Some(before);
        }
    }

    /// Animation-frame tick: apply a pending scroll restore.
    pub fn on_frame(&mut self) {
        if let Some(position) = self.pending_restore.take() {
            self.surface.set_scroll_position(position);
        }
    }

    pub fn restore_pending(&self) -> bool {
        self.pending_restore.is_some()
    }
}

/// Headless terminal surface backed by a vt100 parser with scrollback.
pub struct Vt100Surface {
    parser: vt100::Parser,
}

impl Vt100Surface {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_scrollback(cols, rows, DEFAULT_SCROLLBACK)
    }

    pub fn with_scrollback(cols: u16, rows: u16, scrollback: usize) -> Self {
        Self {
            parser: vt100::Parser::new(rows.max(1), cols.max(1), scrollback),
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_size(rows.max(1), cols.max(1));
    }

    /// Visible text at the current scroll position.
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }

    pub fn screen(&self) -> &vt100::Screen {
        self.parser.screen()
    }

    /// Where touch scrolling should go for what is on screen now.
    pub fn scroll_target(&self) -> ScrollTarget {
        let screen = self.parser.screen();
        if !screen.alternate_screen() {
            return ScrollTarget::History;
        }
        match screen.mouse_protocol_mode() {
            vt100::MouseProtocolMode::None => ScrollTarget::ArrowKeys,
            _ => ScrollTarget::MouseWheel {
                sgr: screen.mouse_protocol_encoding() == vt100::MouseProtocolEncoding::Sgr,
            },
        }
    }

    /// Rows of history reachable above the live screen.
    ///
    /// vt100 underflows when rendering with a scrollback offset larger than
    /// the screen height, so history is reachable one screen deep.
    fn history_len(&mut self) -> usize {
        let offset = self.parser.screen().scrollback();
        self.parser.set_scrollback(usize::MAX);
        let len = self.parser.screen().scrollback();
        self.parser.set_scrollback(offset);
        let (rows, _) = self.parser.screen().size();
        len.min(usize::from(rows))
    }
}

impl TerminalSurface for Vt100Surface {
    fn write(&mut self, text: &str) {
        self.parser.process(text.as_bytes());
        // New rows push a scrolled-back view further up; keep it renderable.
        let (rows, _) = self.parser.screen().size();
        if self.parser.screen().scrollback() > usize::from(rows) {
            self.parser.set_scrollback(usize::from(rows));
        }
    }

    fn scroll_position(&mut self) -> usize {
        let back = self.parser.screen().scrollback();
        self.history_len().saturating_sub(back)
    }

    fn scroll_max(&mut self) -> usize {
        self.history_len()
    }

    fn set_scroll_position(&mut self, position: usize) {
        let max = self.history_len();
        self.parser.set_scrollback(max.saturating_sub(position.min(max)));
    }
}
