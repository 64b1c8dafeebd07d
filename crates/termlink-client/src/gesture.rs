//! Touch scrolling for terminals without a native scroll gesture.
//!
//! [`TouchScroller`] turns a touch drag into whole-line scroll steps, with a
//! short momentum fling after release. [`scroll_input`] converts those steps
//! into input for full-screen programs that own the scroll (mouse wheel
//! reports when the program asked for mouse events, arrow keys otherwise);
//! on the normal screen the steps scroll local history and nothing is sent.

use std::collections::VecDeque;
use std::time::Instant;

/// Pixels of vertical travel before a touch counts as a scroll.
const SCROLL_THRESHOLD: f32 = 5.0;
/// Approximate rendered line height in pixels.
const LINE_HEIGHT: f32 = 17.0;
/// Velocity multiplier per animation frame.
const FRICTION: f32 = 0.94;
/// Below this many pixels per frame the fling stops.
const MIN_VELOCITY: f32 = 0.3;
/// Milliseconds per animation frame.
const FRAME_MS: f32 = 16.0;
const VELOCITY_SAMPLES: usize = 5;

/// How the touch ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TouchEnd {
    /// No scroll happened; treat as a tap (focus the terminal).
    Tap,
    /// Scrolled and released without enough speed to fling.
    Released,
    /// Scrolled and flung; call [`TouchScroller::momentum_frame`] each frame.
    Fling,
}

/// Where scroll steps should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollTarget {
    /// Local scrollback; no input is sent.
    History,
    /// A full-screen program without mouse reporting: send arrow keys.
    ArrowKeys,
    /// A full-screen program with mouse reporting on.
    MouseWheel { sgr: bool },
}

/// Drag-to-scroll tracker for one touch surface.
#[derive(Debug, Default)]
pub struct TouchScroller {
    start: (f32, f32),
    last_y: f32,
    last_at: Option<Instant>,
    scrolling: bool,
    /// Fractional lines not yet emitted.
    accumulated: f32,
    /// Pixels per frame while flinging.
    velocity: f32,
    samples: VecDeque<(f32, f32)>,
}

impl TouchScroller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch_start(&mut self, x: f32, y: f32, at: Instant) {
        self.cancel_momentum();
        self.start = (x, y);
        self.last_y = y;
        self.last_at = Some(at);
        self.samples.clear();
        self.scrolling = false;
    }

    /// Finger moved. Returns whole lines to scroll (positive is toward newer
    /// output).
    pub fn touch_move(&mut self, x: f32, y: f32, at: Instant) -> i32 {
        let delta_y = self.last_y - y;
        let total_y = self.start.1 - y;
        let total_x = self.start.0 - x;
        let delta_ms = self
            .last_at
            .map(|last| at.saturating_duration_since(last).as_secs_f32() * 1000.0)
            .unwrap_or(0.0);

        if !self.scrolling && total_y.abs() > SCROLL_THRESHOLD && total_y.abs() > total_x.abs() {
            self.scrolling = true;
        }

        let mut lines = 0;
        if self.scrolling {
            lines = self.scroll_by(delta_y);
            if delta_ms > 0.0 {
                self.samples.push_back((delta_y, delta_ms));
                if self.samples.len() > VELOCITY_SAMPLES {
                    self.samples.pop_front();
                }
            }
        }

        self.last_y = y;
        self.last_at = Some(at);
        lines
    }

    pub fn touch_end(&mut self) -> TouchEnd {
        if !self.scrolling {
            return TouchEnd::Tap;
        }
        self.scrolling = false;

        let (dy, dt) = self
            .samples
            .iter()
            .fold((0.0, 0.0), |(dy, dt), (sy, st)| (dy + sy, dt + st));
        self.velocity = if dt > 0.0 { dy / dt * FRAME_MS } else { 0.0 };

        if self.velocity.abs() > MIN_VELOCITY {
            TouchEnd::Fling
        } else {
            self.cancel_momentum();
            TouchEnd::Released
        }
    }

    /// Advance the fling by one frame. `None` once it has stopped.
    pub fn momentum_frame(&mut self) -> Option<i32> {
        if self.velocity.abs() < MIN_VELOCITY {
            self.cancel_momentum();
            return None;
        }
        let lines = self.scroll_by(self.velocity);
        self.velocity *= FRICTION;
        Some(lines)
    }

    pub fn is_flinging(&self) -> bool {
        self.velocity.abs() >= MIN_VELOCITY
    }

    pub fn cancel_momentum(&mut self) {
        self.velocity = 0.0;
        self.accumulated = 0.0;
    }

    fn scroll_by(&mut self, pixels: f32) -> i32 {
        self.accumulated += pixels / LINE_HEIGHT;
        let lines = self.accumulated.trunc();
        self.accumulated -= lines;
        lines as i32
    }
}

/// Input that scrolls a full-screen program by `lines`, or `None` when the
/// steps belong to local history.
pub fn scroll_input(lines: i32, target: ScrollTarget) -> Option<String> {
    if lines == 0 {
        return None;
    }
    let count = lines.unsigned_abs() as usize;
    let down = lines > 0;
    match target {
        ScrollTarget::History => None,
        ScrollTarget::ArrowKeys => Some(if down { "\x1b[B" } else { "\x1b[A" }.repeat(count)),
        ScrollTarget::MouseWheel { sgr } => {
            // Wheel up is button 64, wheel down 65; reported at cell 1,1.
            let button = if down { 65 } else { 64 };
            let report = if sgr {
                format!("\x1b[<{button};1;1M")
            } else {
                let mut raw = String::from("\x1b[M");
                raw.push(char::from(32 + button as u8));
                raw.push('!');
                raw.push('!');
                raw
            };
            Some(report.repeat(count))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ms(base: Instant, n: u64) -> Instant {
        base + Duration::from_millis(n)
    }

    #[test]
    fn tap_does_not_scroll() {
        let t0 = Instant::now();
        let mut s = TouchScroller::new();
        s.touch_start(100.0, 300.0, t0);
        assert_eq!(s.touch_move(101.0, 298.0, ms(t0, 16)), 0);
        assert_eq!(s.touch_end(), TouchEnd::Tap);
    }

    #[test]
    fn horizontal_swipe_is_not_a_scroll() {
        let t0 = Instant::now();
        let mut s = TouchScroller::new();
        s.touch_start(100.0, 300.0, t0);
        assert_eq!(s.touch_move(200.0, 290.0, ms(t0, 16)), 0);
        assert_eq!(s.touch_end(), TouchEnd::Tap);
    }

    #[test]
    fn drag_up_scrolls_whole_lines_toward_newer_output() {
        let t0 = Instant::now();
        let mut s = TouchScroller::new();
        s.touch_start(100.0, 300.0, t0);
        let mut total = 0;
        for step in 1..=10 {
            total += s.touch_move(100.0, 300.0 - 17.0 * step as f32, ms(t0, 100 * step));
        }
        assert_eq!(total, 10);
        // Hold still before lifting so no speed is left.
        for step in 11..=16 {
            assert_eq!(s.touch_move(100.0, 130.0, ms(t0, 100 * step)), 0);
        }
        assert_eq!(s.touch_end(), TouchEnd::Released);
    }

    #[test]
    fn fast_flick_flings_and_decays() {
        let t0 = Instant::now();
        let mut s = TouchScroller::new();
        s.touch_start(100.0, 500.0, t0);
        s.touch_move(100.0, 440.0, ms(t0, 16));
        s.touch_move(100.0, 380.0, ms(t0, 32));
        assert_eq!(s.touch_end(), TouchEnd::Fling);

        let mut frames = 0;
        let mut lines = 0;
        while let Some(step) = s.momentum_frame() {
            assert!(step >= 0);
            lines += step;
            frames += 1;
            assert!(frames < 1000, "fling never stopped");
        }
        assert!(lines > 0);
        assert!(!s.is_flinging());
    }

    #[test]
    fn new_touch_cancels_fling() {
        let t0 = Instant::now();
        let mut s = TouchScroller::new();
        s.touch_start(0.0, 500.0, t0);
        s.touch_move(0.0, 400.0, ms(t0, 16));
        assert_eq!(s.touch_end(), TouchEnd::Fling);
        s.touch_start(0.0, 0.0, ms(t0, 40));
        assert_eq!(s.momentum_frame(), None);
    }

    #[test]
    fn scroll_input_per_target() {
        assert_eq!(scroll_input(3, ScrollTarget::History), None);
        assert_eq!(scroll_input(0, ScrollTarget::ArrowKeys), None);
        assert_eq!(scroll_input(2, ScrollTarget::ArrowKeys).unwrap(), "\x1b[B\x1b[B");
        assert_eq!(scroll_input(-1, ScrollTarget::ArrowKeys).unwrap(), "\x1b[A");
        assert_eq!(
            scroll_input(-2, ScrollTarget::MouseWheel { sgr: true }).unwrap(),
            "\x1b[<64;1;1M\x1b[<64;1;1M"
        );
        assert_eq!(
            scroll_input(1, ScrollTarget::MouseWheel { sgr: false }).unwrap(),
            "\x1b[Ma!!"
        );
    }
}
