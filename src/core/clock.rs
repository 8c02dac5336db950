//! Presentation clock: maps wall time to media time
//!
//! The session does not own the clock - the embedder injects one (audio
//! clock, network clock...). `SystemClock` is the stock implementation backed
//! by `Instant`, used by the demo and tests.
//!
//! # Timing Model
//!
//! `media = anchor_media + (now - anchor_wall) * rate` while running.
//! Rate changes and pauses re-anchor, so media time never jumps.

use std::sync::Mutex;
use std::time::Instant;

use log::trace;

use super::frame::MediaTime;

/// Time source correlated with wall-clock time
pub trait PresentationClock: Send + Sync {
    /// Current media time (microseconds)
    fn time(&self) -> MediaTime;
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    anchor_wall: Instant,
    anchor_media: MediaTime,
    rate: f32,
    running: bool,
}

impl ClockState {
    fn now(&self, wall: Instant) -> MediaTime {
        if !self.running {
            return self.anchor_media;
        }
        let elapsed = wall.saturating_duration_since(self.anchor_wall).as_micros() as f64;
        self.anchor_media + (elapsed * self.rate as f64) as MediaTime
    }
}

/// Monotonic clock driven by `Instant`
#[derive(Debug)]
pub struct SystemClock {
    state: Mutex<ClockState>,
}

impl SystemClock {
    /// Stopped clock at media time 0, rate 1.0
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                anchor_wall: Instant::now(),
                anchor_media: 0,
                rate: 1.0,
                running: false,
            }),
        }
    }

    /// Start (or resume) running from the current media position
    pub fn start(&self) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        s.anchor_media = s.now(now);
        s.anchor_wall = now;
        s.running = true;
        trace!("SystemClock started at {} us, rate {}", s.anchor_media, s.rate);
    }

    /// Freeze media time
    pub fn pause(&self) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        s.anchor_media = s.now(now);
        s.anchor_wall = now;
        s.running = false;
    }

    /// Jump to `position`, keeping run state
    pub fn seek(&self, position: MediaTime) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.anchor_media = position;
        s.anchor_wall = Instant::now();
    }

    /// Change rate without a discontinuity
    pub fn set_rate(&self, rate: f32) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        s.anchor_media = s.now(now);
        s.anchor_wall = now;
        s.rate = rate;
    }

    pub fn rate(&self) -> f32 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).rate
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).running
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PresentationClock for SystemClock {
    fn time(&self) -> MediaTime {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).now(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stopped_clock_does_not_advance() {
        let clock = SystemClock::new();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.time(), 0);
    }

    #[test]
    fn test_running_clock_advances() {
        let clock = SystemClock::new();
        clock.start();
        std::thread::sleep(Duration::from_millis(20));
        let t = clock.time();
        assert!(t >= 20_000, "clock at {}", t);
    }

    #[test]
    fn test_pause_freezes_and_seek_jumps() {
        let clock = SystemClock::new();
        clock.seek(5_000_000);
        clock.start();
        clock.pause();
        let frozen = clock.time();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.time(), frozen);
        assert!(frozen >= 5_000_000);
    }

    #[test]
    fn test_reverse_rate_runs_backwards() {
        let clock = SystemClock::new();
        clock.seek(1_000_000);
        clock.set_rate(-1.0);
        clock.start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(clock.time() < 1_000_000);
    }
}
