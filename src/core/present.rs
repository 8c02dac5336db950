//! Present engine - puts frames on screen and into the shared pool
//!
//! **Why**: Single place that touches the device for presentation, so device
//! health checks, stale-frame filtering and "last presented" bookkeeping
//! happen in one serialized path.
//!
//! **Used by**: `Scheduler` (as its `Presentable` target), session
//! (`repaint`, format/geometry changes).
//!
//! # Device loss
//!
//! Every `present()` starts with `check_device_state()`:
//! - `Reset`: device recreated, target re-allocated, both pools invalidated,
//!   last frame dropped, `DeviceReset` emitted. Presentation continues.
//! - `Removed`: `DeviceRemoved` emitted once, `PresentError::DeviceRemoved`
//!   returned (fatal for the session).
//!
//! Events are emitted after the engine lock is released.

use std::sync::{Arc, Mutex};

use dpi::PhysicalSize;
use log::{debug, error, info, trace, warn};

use super::device::{DestRect, Device, DeviceState, SurfaceDesc};
use super::error::{DeviceError, PresentError};
use super::event_bus::{EngineEvent, EventBus};
use super::frame::{Frame, MediaTime};
use super::frame_pool::FramePool;
use super::scheduler::Presentable;
use super::shared_pool::SharedSurfacePool;

#[derive(Debug)]
struct EngineInner {
    state: DeviceState,
    last: Option<Frame>,
    dest: Option<DestRect>,
    target_size: Option<PhysicalSize<u32>>,
    format: Option<SurfaceDesc>,
    fallback_color: [f32; 4],
    presented: u64,
    shut_down: bool,
}

/// Presents frames on the device target
pub struct PresentEngine {
    device: Arc<dyn Device>,
    frame_pool: Arc<FramePool>,
    shared_pool: Option<Arc<SharedSurfacePool>>,
    events: EventBus,
    inner: Mutex<EngineInner>,
}

impl std::fmt::Debug for PresentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentEngine")
            .field("device", &self.device.name())
            .field("shared", &self.shared_pool.is_some())
            .field("state", &self.device_state())
            .finish()
    }
}

impl PresentEngine {
    pub fn new(
        device: Arc<dyn Device>,
        frame_pool: Arc<FramePool>,
        shared_pool: Option<Arc<SharedSurfacePool>>,
        events: EventBus,
        fallback_color: [f32; 4],
    ) -> Self {
        Self {
            device,
            frame_pool,
            shared_pool,
            events,
            inner: Mutex::new(EngineInner {
                state: DeviceState::Ok,
                last: None,
                dest: None,
                target_size: None,
                format: None,
                fallback_color,
                presented: 0,
                shut_down: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Probe the device and recover from a reset.
    ///
    /// `Ok(DeviceState::Reset)` means recovery happened and every frame from
    /// before this call is stale.
    pub fn check_device_state(&self) -> Result<DeviceState, PresentError> {
        let mut pending = Vec::new();
        let result = {
            let mut inner = self.lock();
            self.check_locked(&mut inner, &mut pending)
        };
        self.finish(pending);
        result
    }

    fn check_locked(
        &self,
        inner: &mut EngineInner,
        pending: &mut Vec<Deferred>,
    ) -> Result<DeviceState, PresentError> {
        if inner.state == DeviceState::Removed {
            return Err(PresentError::DeviceRemoved);
        }
        match self.device.probe() {
            DeviceState::Ok => Ok(DeviceState::Ok),
            DeviceState::Removed => Err(self.removed_locked(inner, pending)),
            DeviceState::Reset => {
                warn!("PresentEngine: device reset detected, recovering");
                inner.state = DeviceState::Reset;
                if let Err(e) = self.device.recreate() {
                    return Err(self.device_failed_locked(inner, pending, e));
                }
                if let Some(size) = inner.target_size
                    && let Err(e) = self.device.resize_target(size)
                {
                    return Err(self.device_failed_locked(inner, pending, e));
                }

                let generation = self.frame_pool.invalidate();
                if let Some(shared) = &self.shared_pool {
                    shared.invalidate();
                }
                if let Some(stale) = inner.last.take() {
                    pending.push(Deferred::Release(stale));
                }
                inner.state = DeviceState::Ok;
                info!("PresentEngine: device recovered, generation {}", generation);
                pending.push(Deferred::Emit(EngineEvent::DeviceReset { generation }));
                Ok(DeviceState::Reset)
            }
        }
    }

    fn removed_locked(&self, inner: &mut EngineInner, pending: &mut Vec<Deferred>) -> PresentError {
        if inner.state != DeviceState::Removed {
            error!("PresentEngine: device removed");
            inner.state = DeviceState::Removed;
            if let Some(last) = inner.last.take() {
                pending.push(Deferred::Release(last));
            }
            pending.push(Deferred::Emit(EngineEvent::DeviceRemoved));
        }
        PresentError::DeviceRemoved
    }

    fn device_failed_locked(
        &self,
        inner: &mut EngineInner,
        pending: &mut Vec<Deferred>,
        e: DeviceError,
    ) -> PresentError {
        match e {
            DeviceError::Removed => self.removed_locked(inner, pending),
            other => PresentError::Device(other),
        }
    }

    /// Run deferred pool releases and event emission outside the lock
    fn finish(&self, pending: Vec<Deferred>) {
        for d in pending {
            match d {
                Deferred::Release(frame) => self.frame_pool.release(frame),
                Deferred::Drop(frame) => self.drop_frame(frame),
                Deferred::Emit(event) => self.events.emit(event),
            }
        }
    }

    /// Return a frame that never reached the screen and report it
    fn drop_frame(&self, frame: Frame) {
        let serial = frame.serial();
        self.frame_pool.release(frame);
        self.events.emit(EngineEvent::FrameDropped { serial });
    }

    /// Present `frame`, or re-present the last frame (fallback color if none)
    pub fn present(&self, frame: Option<Frame>) -> Result<(), PresentError> {
        let mut pending = Vec::new();
        let result = {
            let mut inner = self.lock();
            self.present_locked(&mut inner, frame, &mut pending)
        };
        self.finish(pending);
        result
    }

    fn present_locked(
        &self,
        inner: &mut EngineInner,
        frame: Option<Frame>,
        pending: &mut Vec<Deferred>,
    ) -> Result<(), PresentError> {
        if inner.shut_down {
            if let Some(frame) = frame {
                pending.push(Deferred::Drop(frame));
            }
            return Ok(());
        }

        if let Err(e) = self.check_locked(inner, pending) {
            if let Some(frame) = frame {
                pending.push(Deferred::Drop(frame));
            }
            return Err(e);
        }

        let Some(frame) = frame else {
            return self.repaint_locked(inner, pending);
        };

        if !self.frame_pool.is_current(&frame) {
            trace!(
                "PresentEngine: discarding stale frame {} (generation {})",
                frame.serial(),
                frame.generation()
            );
            pending.push(Deferred::Drop(frame));
            return Ok(());
        }

        let dest = Self::dest_for(inner, frame.desc());
        if let Err(e) = self
            .device
            .blit_to_target(frame.surface(), dest)
            .and_then(|_| self.device.present_target())
        {
            pending.push(Deferred::Drop(frame));
            return Err(self.device_failed_locked(inner, pending, e));
        }

        if let Some(shared) = &self.shared_pool
            && let Err(e) = self.publish_shared(shared, &frame)
        {
            if e == DeviceError::Removed {
                pending.push(Deferred::Drop(frame));
                return Err(self.removed_locked(inner, pending));
            }
            warn!("PresentEngine: shared surface publish failed: {}", e);
        }

        let serial = frame.serial();
        let timestamp = frame.timestamp();
        if let Some(previous) = inner.last.replace(frame) {
            pending.push(Deferred::Release(previous));
        }
        inner.presented += 1;
        trace!("PresentEngine: presented frame {} @ {} us", serial, timestamp);
        pending.push(Deferred::Emit(EngineEvent::FramePresented { serial, timestamp }));
        Ok(())
    }

    fn repaint_locked(
        &self,
        inner: &mut EngineInner,
        pending: &mut Vec<Deferred>,
    ) -> Result<(), PresentError> {
        let drawn = match &inner.last {
            Some(last) => {
                let dest = Self::dest_for(inner, last.desc());
                self.device.blit_to_target(last.surface(), dest)
            }
            None => self.device.clear_target(inner.fallback_color),
        };
        if let Err(e) = drawn.and_then(|_| self.device.present_target()) {
            return Err(self.device_failed_locked(inner, pending, e));
        }
        Ok(())
    }

    fn dest_for(inner: &EngineInner, desc: &SurfaceDesc) -> DestRect {
        inner
            .dest
            .unwrap_or_else(|| DestRect::full(inner.target_size.unwrap_or(desc.size)))
    }

    fn publish_shared(&self, shared: &SharedSurfacePool, frame: &Frame) -> Result<(), DeviceError> {
        let mut entry = shared.get_free(frame.desc())?;
        if let Err(e) = self.device.copy_surface(frame.surface(), entry.surface()) {
            shared.recycle(entry);
            return Err(e);
        }
        entry.set_frame_info(frame.timestamp(), frame.serial());
        shared.publish(entry);
        Ok(())
    }

    /// Set the decoded-frame format. Pools are invalidated only on change.
    /// Returns true if the format changed.
    pub fn set_video_format(&self, desc: SurfaceDesc) -> Result<bool, PresentError> {
        if desc.is_empty() {
            return Err(PresentError::InvalidFormat(format!(
                "{}x{} surface",
                desc.size.width, desc.size.height
            )));
        }

        let mut pending = Vec::new();
        {
            let mut inner = self.lock();
            if inner.format == Some(desc) {
                return Ok(false);
            }
            inner.format = Some(desc);
            self.frame_pool.configure(desc);
            if let Some(shared) = &self.shared_pool {
                shared.invalidate();
            }
            if let Some(stale) = inner.last.take() {
                pending.push(Deferred::Release(stale));
            }
            let generation = self.frame_pool.generation();
            debug!("PresentEngine: video format {:?} (generation {})", desc, generation);
            pending.push(Deferred::Emit(EngineEvent::FormatChanged { desc, generation }));
        }
        self.finish(pending);
        Ok(true)
    }

    pub fn video_format(&self) -> Option<SurfaceDesc> {
        self.lock().format
    }

    /// Geometry only; never touches device resources
    pub fn set_destination_rect(&self, rect: DestRect) {
        self.lock().dest = Some(rect);
    }

    pub fn destination_rect(&self) -> Option<DestRect> {
        self.lock().dest
    }

    /// Resize the on-screen target. Returns false if the size is unchanged.
    pub fn resize_target(&self, size: PhysicalSize<u32>) -> Result<bool, PresentError> {
        let mut pending = Vec::new();
        let result = {
            let mut inner = self.lock();
            if inner.target_size == Some(size) {
                Ok(false)
            } else {
                match self.device.resize_target(size) {
                    Ok(()) => {
                        inner.target_size = Some(size);
                        Ok(true)
                    }
                    Err(e) => Err(self.device_failed_locked(&mut inner, &mut pending, e)),
                }
            }
        };
        self.finish(pending);
        result
    }

    /// Release the last presented frame; later presents are no-ops
    pub fn shutdown(&self) {
        let last = {
            let mut inner = self.lock();
            inner.shut_down = true;
            inner.last.take()
        };
        if let Some(frame) = last {
            self.frame_pool.release(frame);
        }
        debug!("PresentEngine shut down");
    }

    pub fn device_state(&self) -> DeviceState {
        self.lock().state
    }

    /// (serial, timestamp) of the frame currently on screen
    pub fn last_presented(&self) -> Option<(u64, MediaTime)> {
        self.lock()
            .last
            .as_ref()
            .map(|f| (f.serial(), f.timestamp()))
    }

    pub fn presented_count(&self) -> u64 {
        self.lock().presented
    }

    pub fn frame_pool(&self) -> &Arc<FramePool> {
        &self.frame_pool
    }

    pub fn shared_pool(&self) -> Option<&Arc<SharedSurfacePool>> {
        self.shared_pool.as_ref()
    }
}

impl Presentable for PresentEngine {
    fn present(&self, frame: Option<Frame>) -> Result<(), PresentError> {
        PresentEngine::present(self, frame)
    }

    fn discard(&self, frame: Frame) {
        trace!("PresentEngine: frame {} discarded", frame.serial());
        self.drop_frame(frame);
    }
}

/// Side effects postponed until the engine lock is dropped
enum Deferred {
    Release(Frame),
    /// Frame that was never shown
    Drop(Frame),
    Emit(EngineEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{SoftDevice, SoftInterop};
    use crate::core::device::PixelFormat;

    struct Rig {
        device: Arc<SoftDevice>,
        pool: Arc<FramePool>,
        shared: Arc<SharedSurfacePool>,
        bus: EventBus,
        engine: PresentEngine,
    }

    fn rig() -> Rig {
        let device = Arc::new(SoftDevice::new());
        let bus = EventBus::detached();
        let pool = Arc::new(FramePool::new(device.clone(), 4, bus.clone()));
        let shared = SharedSurfacePool::new(device.clone(), Arc::new(SoftInterop::new()), 2);
        let engine = PresentEngine::new(
            device.clone(),
            pool.clone(),
            Some(shared.clone()),
            bus.clone(),
            [0.0, 0.0, 0.0, 1.0],
        );
        engine
            .set_video_format(SurfaceDesc::new(8, 8, PixelFormat::Bgra8))
            .unwrap();
        Rig {
            device,
            pool,
            shared,
            bus,
            engine,
        }
    }

    fn tagged(rig: &Rig, tag: u64) -> Frame {
        let mut frame = rig.pool.acquire().unwrap().unwrap();
        rig.device.upload(frame.surface(), &tag.to_le_bytes()).unwrap();
        frame.set_timing(tag as MediaTime * 1000, 1000);
        frame
    }

    #[test]
    fn test_present_blits_and_publishes() {
        let r = rig();
        let frame = tagged(&r, 7);
        let serial = frame.serial();
        r.engine.present(Some(frame)).unwrap();

        assert_eq!(r.device.last_present().unwrap().tag, Some(7));
        assert_eq!(r.engine.last_presented(), Some((serial, 7000)));

        let handle = r.shared.consume().unwrap().unwrap();
        assert_eq!(r.device.content_tag(handle.surface_id()), Some(7));
        assert_eq!(handle.serial(), serial);
        assert!(
            r.bus
                .poll()
                .iter()
                .any(|e| e.event == EngineEvent::FramePresented { serial, timestamp: 7000 })
        );
    }

    #[test]
    fn test_previous_frame_released_on_next_present() {
        let r = rig();
        r.engine.present(Some(tagged(&r, 1))).unwrap();
        assert_eq!(r.pool.outstanding(), 1);
        r.engine.present(Some(tagged(&r, 2))).unwrap();
        // frame 1 back in the pool, frame 2 on screen
        assert_eq!(r.pool.outstanding(), 1);
        assert_eq!(r.pool.free_len(), 1);
    }

    #[test]
    fn test_repaint_last_or_fallback() {
        let r = rig();
        r.engine.present(None).unwrap();
        assert_eq!(r.device.last_present().unwrap().tag, None);
        assert_eq!(r.device.stats().clears, 1);

        r.engine.present(Some(tagged(&r, 3))).unwrap();
        r.engine.present(None).unwrap();
        assert_eq!(r.device.last_present().unwrap().tag, Some(3));
        assert_eq!(r.engine.presented_count(), 1);
    }

    #[test]
    fn test_stale_frame_never_presented() {
        let r = rig();
        let frame = tagged(&r, 9);
        let serial = frame.serial();
        r.pool.invalidate();
        r.engine.present(Some(frame)).unwrap();
        assert!(r.device.last_present().is_none());
        assert_eq!(r.engine.presented_count(), 0);
        assert!(
            r.bus
                .poll()
                .iter()
                .any(|e| e.event == EngineEvent::FrameDropped { serial })
        );
    }

    #[test]
    fn test_discard_reports_dropped_frame() {
        let r = rig();
        let frame = tagged(&r, 5);
        let serial = frame.serial();
        Presentable::discard(&r.engine, frame);
        assert_eq!(r.pool.outstanding(), 0);
        let evs: Vec<EngineEvent> = r.bus.poll().into_iter().map(|e| e.event).collect();
        assert!(evs.contains(&EngineEvent::NeedInput));
        assert!(evs.contains(&EngineEvent::FrameDropped { serial }));
        assert!(r.device.last_present().is_none());
    }

    #[test]
    fn test_reset_recovers_and_invalidates() {
        let r = rig();
        r.engine.present(Some(tagged(&r, 1))).unwrap();
        let old_gen = r.pool.generation();
        let frame = tagged(&r, 2);

        r.device.inject_reset();
        // in-flight frame from before the reset is dropped, not shown
        r.engine.present(Some(frame)).unwrap();
        assert_eq!(r.pool.generation(), old_gen + 1);
        assert_eq!(r.engine.last_presented(), None);
        assert_eq!(r.engine.device_state(), DeviceState::Ok);
        assert!(
            r.bus
                .poll()
                .iter()
                .any(|e| e.event == EngineEvent::DeviceReset { generation: old_gen + 1 })
        );

        let fresh = tagged(&r, 3);
        assert_eq!(fresh.generation(), old_gen + 1);
        r.engine.present(Some(fresh)).unwrap();
        assert_eq!(r.device.last_present().unwrap().tag, Some(3));
    }

    #[test]
    fn test_removed_is_fatal() {
        let r = rig();
        let frame = tagged(&r, 1);
        r.device.inject_removal();
        assert_eq!(r.engine.present(Some(frame)), Err(PresentError::DeviceRemoved));
        assert_eq!(r.engine.present(None), Err(PresentError::DeviceRemoved));
        let removed = r
            .bus
            .poll()
            .into_iter()
            .filter(|e| e.event == EngineEvent::DeviceRemoved)
            .count();
        assert_eq!(removed, 1);
        assert_eq!(r.pool.outstanding(), 0);
    }

    #[test]
    fn test_format_change_only_when_different() {
        let r = rig();
        let generation = r.pool.generation();
        let same = SurfaceDesc::new(8, 8, PixelFormat::Bgra8);
        assert!(!r.engine.set_video_format(same).unwrap());
        assert_eq!(r.pool.generation(), generation);

        assert!(r.engine.set_video_format(SurfaceDesc::new(16, 16, PixelFormat::Nv12)).unwrap());
        assert_eq!(r.pool.generation(), generation + 1);
        assert!(r.engine.set_video_format(SurfaceDesc::new(0, 16, PixelFormat::Nv12)).is_err());
    }

    #[test]
    fn test_destination_rect_and_resize() {
        let r = rig();
        let rect = DestRect::new(10, 20, 320, 240);
        r.engine.set_destination_rect(rect);
        r.engine.present(Some(tagged(&r, 4))).unwrap();
        assert_eq!(r.device.last_present().unwrap().dest, Some(rect));
        assert_eq!(r.device.stats().target_resizes, 0);

        let size = PhysicalSize::new(640, 480);
        assert!(r.engine.resize_target(size).unwrap());
        assert!(!r.engine.resize_target(size).unwrap());
        assert_eq!(r.device.stats().target_resizes, 1);
        assert_eq!(r.device.target_size(), size);
    }

    #[test]
    fn test_shutdown_releases_last_frame() {
        let r = rig();
        r.engine.present(Some(tagged(&r, 1))).unwrap();
        r.engine.shutdown();
        assert_eq!(r.pool.outstanding(), 0);
        r.engine.present(Some(tagged(&r, 2))).unwrap();
        assert_eq!(r.engine.last_presented(), None);
    }
}
