//! Bounded frame allocator with generation-based invalidation
//!
//! **Why**: Allocating a GPU surface per decoded picture is far too slow for
//! playback. Frames are allocated lazily up to `capacity` and recycled.
//!
//! **Backpressure**: once `capacity` frames are out, `acquire()` returns
//! `Ok(None)` - it never blocks and never allocates past the bound. The
//! decoder waits for `EngineEvent::NeedInput` (emitted on every release)
//! before decoding into presentation again.
//!
//! **Generation**: `invalidate()` bumps the generation (format change, device
//! reset). Frames from older generations are destroyed when released and
//! never handed out again, so a stale surface can't reach the screen.
//!
//! Free list is a lock-free `ArrayQueue`; the allocation counter and the
//! current descriptor share one small mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::queue::ArrayQueue;
use log::{debug, trace};

use super::device::{Device, SurfaceDesc};
use super::error::DeviceError;
use super::event_bus::{EngineEvent, EventBus};
use super::frame::Frame;

#[derive(Debug)]
struct PoolState {
    desc: Option<SurfaceDesc>,
    /// Frames allocated in the current generation (free + outstanding)
    allocated: usize,
}

/// Reusable frame allocator, safe to share between threads
pub struct FramePool {
    device: Arc<dyn Device>,
    free: ArrayQueue<Frame>,
    capacity: usize,
    state: Mutex<PoolState>,
    generation: AtomicU64,
    next_serial: AtomicU64,
    events: EventBus,
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("device", &self.device.name())
            .field("capacity", &self.capacity)
            .field("free", &self.free.len())
            .field("generation", &self.generation())
            .finish()
    }
}

impl FramePool {
    /// Create an unconfigured pool. `capacity` is clamped to at least 1.
    pub fn new(device: Arc<dyn Device>, capacity: usize, events: EventBus) -> Self {
        let capacity = capacity.max(1);
        debug!("FramePool created: capacity={}, device={}", capacity, device.name());
        Self {
            device,
            free: ArrayQueue::new(capacity),
            capacity,
            state: Mutex::new(PoolState {
                desc: None,
                allocated: 0,
            }),
            generation: AtomicU64::new(1),
            next_serial: AtomicU64::new(1),
            events,
        }
    }

    /// Set the surface format. A different descriptor invalidates the pool.
    /// Returns true if the pool was invalidated.
    pub fn configure(&self, desc: SurfaceDesc) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.desc == Some(desc) {
            return false;
        }
        state.desc = Some(desc);
        let generation = self.invalidate_locked(&mut state);
        debug!("FramePool configured: {:?} (generation {})", desc, generation);
        true
    }

    /// Current descriptor, if configured
    pub fn desc(&self) -> Option<SurfaceDesc> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).desc
    }

    /// Get a free frame, allocating lazily up to capacity.
    ///
    /// `Ok(None)` means "pool empty, retry after a release" (or not configured yet).
    pub fn acquire(&self) -> Result<Option<Frame>, DeviceError> {
        while let Some(frame) = self.free.pop() {
            if frame.generation() == self.generation() {
                return Ok(Some(self.stamp(frame)));
            }
            // Raced with invalidate(): released just before the bump
            trace!("FramePool: dropping stale free frame {}", frame.surface().id());
            self.device.destroy_surface(frame.into_surface());
        }

        let (desc, generation) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let Some(desc) = state.desc else {
                return Ok(None);
            };
            if state.allocated >= self.capacity {
                return Ok(None);
            }
            state.allocated += 1;
            (desc, self.generation())
        };

        match self.device.create_surface(&desc) {
            Ok(surface) => {
                trace!(
                    "FramePool: allocated surface {} (generation {})",
                    surface.id(),
                    generation
                );
                Ok(Some(self.stamp(Frame::new(surface, generation))))
            }
            Err(e) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if self.generation() == generation {
                    state.allocated = state.allocated.saturating_sub(1);
                }
                Err(e)
            }
        }
    }

    /// Return a frame. Stale frames are destroyed, current ones recycled.
    pub fn release(&self, frame: Frame) {
        if frame.generation() != self.generation() {
            trace!(
                "FramePool: discarding stale frame {} (generation {} != {})",
                frame.surface().id(),
                frame.generation(),
                self.generation()
            );
            self.device.destroy_surface(frame.into_surface());
            return;
        }

        if let Err(frame) = self.free.push(frame) {
            // More frames than capacity: can only follow an invalidate race
            self.device.destroy_surface(frame.into_surface());
            return;
        }
        self.events.emit(EngineEvent::NeedInput);
    }

    /// Bump generation and free all pooled surfaces. Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.invalidate_locked(&mut state)
    }

    fn invalidate_locked(&self, state: &mut PoolState) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        state.allocated = 0;
        let mut destroyed = 0;
        while let Some(frame) = self.free.pop() {
            self.device.destroy_surface(frame.into_surface());
            destroyed += 1;
        }
        debug!(
            "FramePool invalidated: generation {}, destroyed {} surfaces",
            generation, destroyed
        );
        generation
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames sitting in the free list
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Frames of the current generation held outside the pool
    pub fn outstanding(&self) -> usize {
        let allocated = self.state.lock().unwrap_or_else(|e| e.into_inner()).allocated;
        allocated.saturating_sub(self.free.len())
    }

    /// True if `frame` belongs to the current generation
    pub fn is_current(&self, frame: &Frame) -> bool {
        frame.generation() == self.generation()
    }

    fn stamp(&self, mut frame: Frame) -> Frame {
        frame.stamp(self.next_serial.fetch_add(1, Ordering::Relaxed));
        frame
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        while let Some(frame) = self.free.pop() {
            self.device.destroy_surface(frame.into_surface());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftDevice;
    use crate::core::device::PixelFormat;

    fn pool(capacity: usize) -> (Arc<SoftDevice>, FramePool) {
        let device = Arc::new(SoftDevice::new());
        let pool = FramePool::new(device.clone(), capacity, EventBus::detached());
        pool.configure(SurfaceDesc::new(16, 8, PixelFormat::Bgra8));
        (device, pool)
    }

    #[test]
    fn test_unconfigured_pool_is_empty() {
        let device = Arc::new(SoftDevice::new());
        let pool = FramePool::new(device, 2, EventBus::detached());
        assert!(pool.acquire().unwrap().is_none());
    }

    #[test]
    fn test_backpressure_after_capacity() {
        let (device, pool) = pool(3);
        let frames: Vec<Frame> = (0..3).map(|_| pool.acquire().unwrap().unwrap()).collect();
        assert_eq!(device.live_surfaces(), 3);

        // N+1th acquire: empty, no allocation
        assert!(pool.acquire().unwrap().is_none());
        assert_eq!(device.live_surfaces(), 3);
        assert_eq!(pool.outstanding(), 3);

        for f in frames {
            pool.release(f);
        }
        assert_eq!(pool.free_len(), 3);
        assert!(pool.acquire().unwrap().is_some());
        assert_eq!(device.surfaces_created(), 3);
    }

    #[test]
    fn test_recycles_same_surface() {
        let (device, pool) = pool(1);
        let frame = pool.acquire().unwrap().unwrap();
        let id = frame.surface().id();
        let serial = frame.serial();
        pool.release(frame);

        let again = pool.acquire().unwrap().unwrap();
        assert_eq!(again.surface().id(), id);
        assert_ne!(again.serial(), serial);
        assert_eq!(device.surfaces_created(), 1);
    }

    #[test]
    fn test_stale_frame_not_returned_after_invalidate() {
        let (device, pool) = pool(2);
        let frame = pool.acquire().unwrap().unwrap();
        let old_id = frame.surface().id();
        let old_gen = frame.generation();

        let new_gen = pool.invalidate();
        assert_eq!(new_gen, old_gen + 1);
        assert!(!pool.is_current(&frame));

        pool.release(frame);
        assert_eq!(pool.free_len(), 0);

        let fresh = pool.acquire().unwrap().unwrap();
        assert_ne!(fresh.surface().id(), old_id);
        assert_eq!(fresh.generation(), new_gen);
        // the stale surface was destroyed, not leaked
        assert_eq!(device.live_surfaces(), 1);
    }

    #[test]
    fn test_configure_same_desc_is_noop() {
        let (_device, pool) = pool(2);
        let generation = pool.generation();
        assert!(!pool.configure(SurfaceDesc::new(16, 8, PixelFormat::Bgra8)));
        assert_eq!(pool.generation(), generation);
        assert!(pool.configure(SurfaceDesc::new(32, 8, PixelFormat::Bgra8)));
        assert_eq!(pool.generation(), generation + 1);
    }

    #[test]
    fn test_release_emits_need_input() {
        let device = Arc::new(SoftDevice::new());
        let bus = EventBus::detached();
        let pool = FramePool::new(device, 1, bus.clone());
        pool.configure(SurfaceDesc::new(4, 4, PixelFormat::Rgba8));

        let frame = pool.acquire().unwrap().unwrap();
        pool.release(frame);
        let events = bus.poll();
        assert!(events.iter().any(|e| e.event == EngineEvent::NeedInput));
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let (_device, pool) = pool(4);
        let pool = Arc::new(pool);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(frame) = pool.acquire().unwrap() {
                        pool.release(frame);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.free_len() <= 4);
    }
}
