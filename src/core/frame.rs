//! Presentation frame: pooled GPU surface + timing metadata
//!
//! **Ownership**: `Frame` is move-only. At any moment it lives in exactly one
//! place - the pool's free list, the scheduler's pending queue, the present
//! engine's in-flight slot, or a frame-step holding list. Moves between them
//! always go through an explicit call (`FramePool::release`,
//! `Scheduler::enqueue`, `Presentable::discard`...).
//!
//! **Generation**: stamped by the pool at allocation. After the pool is
//! invalidated (format change, device reset) older frames are stale: they are
//! never presented and are destroyed instead of recycled.

use std::time::Duration;

use super::device::{Surface, SurfaceDesc};

/// Media time in microseconds (signed - reverse playback and negative deltas)
pub type MediaTime = i64;

/// Microseconds per second
pub const MEDIA_TIME_PER_SEC: MediaTime = 1_000_000;

/// Frame duration for a given frame rate
pub fn frame_duration(fps: f64) -> MediaTime {
    if fps <= 0.0 {
        return 0;
    }
    (MEDIA_TIME_PER_SEC as f64 / fps).round() as MediaTime
}

/// Convert a non-negative media delta to a wall-clock duration at `rate`
pub fn media_to_wall(delta: MediaTime, rate: f32) -> Duration {
    let rate = rate.abs();
    if delta <= 0 || rate == 0.0 {
        return Duration::ZERO;
    }
    Duration::from_micros((delta as f64 / rate as f64) as u64)
}

/// Pooled video frame
#[derive(Debug)]
pub struct Frame {
    surface: Surface,
    timestamp: MediaTime,
    duration: MediaTime,
    generation: u64,
    serial: u64,
}

impl Frame {
    pub(crate) fn new(surface: Surface, generation: u64) -> Self {
        Self {
            surface,
            timestamp: 0,
            duration: 0,
            generation,
            serial: 0,
        }
    }

    /// Backing surface (decoder uploads into it)
    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn desc(&self) -> &SurfaceDesc {
        self.surface.desc()
    }

    pub fn timestamp(&self) -> MediaTime {
        self.timestamp
    }

    pub fn duration(&self) -> MediaTime {
        self.duration
    }

    /// Set presentation time and duration (decoder side)
    pub fn set_timing(&mut self, timestamp: MediaTime, duration: MediaTime) {
        self.timestamp = timestamp;
        self.duration = duration.max(0);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Unique per acquire; identifies this use of the surface
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn stamp(&mut self, serial: u64) {
        self.serial = serial;
        self.timestamp = 0;
        self.duration = 0;
    }

    pub(crate) fn into_surface(self) -> Surface {
        self.surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration() {
        assert_eq!(frame_duration(30.0), 33_333);
        assert_eq!(frame_duration(25.0), 40_000);
        assert_eq!(frame_duration(0.0), 0);
    }

    #[test]
    fn test_media_to_wall_scales_by_rate() {
        assert_eq!(media_to_wall(40_000, 1.0), Duration::from_millis(40));
        assert_eq!(media_to_wall(40_000, 2.0), Duration::from_millis(20));
        assert_eq!(media_to_wall(40_000, -2.0), Duration::from_millis(20));
        assert_eq!(media_to_wall(-5, 1.0), Duration::ZERO);
        assert_eq!(media_to_wall(40_000, 0.0), Duration::ZERO);
    }
}
