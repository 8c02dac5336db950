//! In-memory graphics backend
//!
//! **Why**: The engine is API-agnostic; this backend gives it something real
//! to drive without a GPU - surfaces are byte buffers, the on-screen target
//! is a log of presents. Used by the demo binary and by every engine test.
//!
//! Fault injection mirrors what real drivers do:
//! - `inject_reset()`: next `probe()` reports `Reset`; `recreate()` wipes all
//!   surfaces (old handles become `InvalidSurface`)
//! - `inject_removal()`: device is gone for good, `recreate()` fails
//! - `fail_allocations(n)`: next `n` allocations return `OutOfMemory`
//!
//! Content tags: the first 8 bytes of a surface read as little-endian `u64`.
//! Tests upload a tag into a frame and check it arrives on the target and in
//! published shared surfaces.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use dpi::PhysicalSize;
use log::{debug, info, trace, warn};

use crate::core::device::{
    DestRect, Device, DeviceState, InteropApi, InteropHandle, Surface, SurfaceDesc, SurfaceId,
};
use crate::core::error::{DeviceError, InteropError};

/// Max entries kept in the target present log
const PRESENT_LOG_SIZE: usize = 256;

/// One flip of the on-screen target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetPresent {
    /// Content tag of the blitted surface, `None` if the target was cleared
    pub tag: Option<u64>,
    pub dest: Option<DestRect>,
    pub at: Instant,
}

/// Operation counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SoftDeviceStats {
    pub created: u64,
    pub destroyed: u64,
    pub copies: u64,
    pub blits: u64,
    pub clears: u64,
    pub presents: u64,
    pub recreates: u64,
    pub target_resizes: u64,
}

#[derive(Debug)]
struct SoftSurface {
    desc: SurfaceDesc,
    data: Vec<u8>,
}

#[derive(Debug)]
struct SoftState {
    health: DeviceState,
    next_id: u64,
    surfaces: HashMap<SurfaceId, SoftSurface>,
    target_size: PhysicalSize<u32>,
    /// What was last drawn to the target, flipped on present
    staged: Option<(Option<u64>, Option<DestRect>)>,
    presents: VecDeque<TargetPresent>,
    fail_allocs: usize,
    stats: SoftDeviceStats,
}

impl SoftState {
    fn check(&self) -> Result<(), DeviceError> {
        match self.health {
            DeviceState::Ok => Ok(()),
            DeviceState::Reset => Err(DeviceError::Lost),
            DeviceState::Removed => Err(DeviceError::Removed),
        }
    }

    fn surface(&self, surface: &Surface) -> Result<&SoftSurface, DeviceError> {
        self.surfaces
            .get(&surface.id())
            .ok_or(DeviceError::InvalidSurface(surface.id()))
    }
}

fn tag_of(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = data.len().min(8);
    bytes[..n].copy_from_slice(&data[..n]);
    u64::from_le_bytes(bytes)
}

/// Software `Device`
#[derive(Debug)]
pub struct SoftDevice {
    name: String,
    state: Mutex<SoftState>,
}

impl SoftDevice {
    pub fn new() -> Self {
        Self::with_target(PhysicalSize::new(1280, 720))
    }

    pub fn with_target(target_size: PhysicalSize<u32>) -> Self {
        Self {
            name: "soft".to_string(),
            state: Mutex::new(SoftState {
                health: DeviceState::Ok,
                next_id: 1,
                surfaces: HashMap::new(),
                target_size,
                staged: None,
                presents: VecDeque::new(),
                fail_allocs: 0,
                stats: SoftDeviceStats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next `probe()` reports `Reset`
    pub fn inject_reset(&self) {
        let mut s = self.lock();
        if s.health == DeviceState::Ok {
            warn!("SoftDevice: injected device reset");
            s.health = DeviceState::Reset;
        }
    }

    /// Device removed permanently
    pub fn inject_removal(&self) {
        warn!("SoftDevice: injected device removal");
        self.lock().health = DeviceState::Removed;
    }

    /// Fail the next `count` allocations with `OutOfMemory`
    pub fn fail_allocations(&self, count: usize) {
        self.lock().fail_allocs = count;
    }

    /// Content tag of a live surface
    pub fn content_tag(&self, id: SurfaceId) -> Option<u64> {
        self.lock().surfaces.get(&id).map(|s| tag_of(&s.data))
    }

    pub fn live_surfaces(&self) -> usize {
        self.lock().surfaces.len()
    }

    pub fn surfaces_created(&self) -> u64 {
        self.lock().stats.created
    }

    pub fn stats(&self) -> SoftDeviceStats {
        self.lock().stats
    }

    pub fn target_size(&self) -> PhysicalSize<u32> {
        self.lock().target_size
    }

    /// Snapshot of recent target presents, oldest first
    pub fn presents(&self) -> Vec<TargetPresent> {
        self.lock().presents.iter().cloned().collect()
    }

    pub fn last_present(&self) -> Option<TargetPresent> {
        self.lock().presents.back().cloned()
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SoftDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_surface(&self, desc: &SurfaceDesc) -> Result<Surface, DeviceError> {
        let mut s = self.lock();
        s.check()?;
        if desc.is_empty() {
            return Err(DeviceError::Incompatible(format!("empty surface {:?}", desc)));
        }
        if s.fail_allocs > 0 {
            s.fail_allocs -= 1;
            return Err(DeviceError::OutOfMemory {
                bytes: desc.buffer_size(),
            });
        }
        let id = SurfaceId(s.next_id);
        s.next_id += 1;
        s.surfaces.insert(
            id,
            SoftSurface {
                desc: *desc,
                data: vec![0u8; desc.buffer_size()],
            },
        );
        s.stats.created += 1;
        trace!("SoftDevice: created surface {} {:?}", id, desc);
        Ok(Surface::new(id, *desc))
    }

    fn destroy_surface(&self, surface: Surface) {
        let mut s = self.lock();
        if s.surfaces.remove(&surface.id()).is_some() {
            s.stats.destroyed += 1;
        }
    }

    fn upload(&self, surface: &Surface, data: &[u8]) -> Result<(), DeviceError> {
        let mut s = self.lock();
        s.check()?;
        let target = s
            .surfaces
            .get_mut(&surface.id())
            .ok_or(DeviceError::InvalidSurface(surface.id()))?;
        let n = data.len().min(target.data.len());
        target.data[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn copy_surface(&self, src: &Surface, dst: &Surface) -> Result<(), DeviceError> {
        let mut s = self.lock();
        s.check()?;
        let src_surface = s.surface(src)?;
        let dst_desc = s.surface(dst)?.desc;
        if src_surface.desc != dst_desc {
            return Err(DeviceError::Incompatible(format!(
                "{:?} -> {:?}",
                src_surface.desc, dst_desc
            )));
        }
        let data = src_surface.data.clone();
        if let Some(target) = s.surfaces.get_mut(&dst.id()) {
            target.data = data;
        }
        s.stats.copies += 1;
        Ok(())
    }

    fn blit_to_target(&self, src: &Surface, dest: DestRect) -> Result<(), DeviceError> {
        let mut s = self.lock();
        s.check()?;
        let tag = tag_of(&s.surface(src)?.data);
        s.staged = Some((Some(tag), Some(dest)));
        s.stats.blits += 1;
        Ok(())
    }

    fn clear_target(&self, _color: [f32; 4]) -> Result<(), DeviceError> {
        let mut s = self.lock();
        s.check()?;
        s.staged = Some((None, None));
        s.stats.clears += 1;
        Ok(())
    }

    fn present_target(&self) -> Result<(), DeviceError> {
        let mut s = self.lock();
        s.check()?;
        let (tag, dest) = s.staged.unwrap_or((None, None));
        if s.presents.len() >= PRESENT_LOG_SIZE {
            s.presents.pop_front();
        }
        s.presents.push_back(TargetPresent {
            tag,
            dest,
            at: Instant::now(),
        });
        s.stats.presents += 1;
        Ok(())
    }

    fn resize_target(&self, size: PhysicalSize<u32>) -> Result<(), DeviceError> {
        let mut s = self.lock();
        s.check()?;
        s.target_size = size;
        s.staged = None;
        s.stats.target_resizes += 1;
        debug!("SoftDevice: target resized to {}x{}", size.width, size.height);
        Ok(())
    }

    fn probe(&self) -> DeviceState {
        self.lock().health
    }

    fn recreate(&self) -> Result<(), DeviceError> {
        let mut s = self.lock();
        if s.health == DeviceState::Removed {
            return Err(DeviceError::Removed);
        }
        let dropped = s.surfaces.len();
        s.surfaces.clear();
        s.staged = None;
        s.health = DeviceState::Ok;
        s.stats.recreates += 1;
        info!("SoftDevice: recreated ({} surfaces invalidated)", dropped);
        Ok(())
    }
}

/// Interop operation counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SoftInteropStats {
    pub registers: u64,
    pub unregisters: u64,
    pub locks: u64,
    pub unlocks: u64,
}

#[derive(Debug)]
struct Registration {
    surface: SurfaceId,
    locked: bool,
}

#[derive(Debug, Default)]
struct InteropState {
    next: u64,
    registrations: HashMap<u64, Registration>,
    fail_registers: usize,
    stats: SoftInteropStats,
}

/// Software `InteropApi`: a registration table with lock flags
#[derive(Debug, Default)]
pub struct SoftInterop {
    state: Mutex<InteropState>,
}

impl SoftInterop {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, InteropState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> SoftInteropStats {
        self.lock_state().stats
    }

    /// Live registrations
    pub fn registered(&self) -> usize {
        self.lock_state().registrations.len()
    }

    /// Registrations currently locked by a consumer
    pub fn locked(&self) -> usize {
        self.lock_state()
            .registrations
            .values()
            .filter(|r| r.locked)
            .count()
    }

    /// Surface behind a registration
    pub fn surface_of(&self, handle: InteropHandle) -> Option<SurfaceId> {
        self.lock_state()
            .registrations
            .get(&handle.0)
            .map(|r| r.surface)
    }

    /// Fail the next `count` registrations
    pub fn fail_registrations(&self, count: usize) {
        self.lock_state().fail_registers = count;
    }
}

impl InteropApi for SoftInterop {
    fn register(&self, surface: &Surface) -> Result<InteropHandle, InteropError> {
        let mut s = self.lock_state();
        if s.fail_registers > 0 {
            s.fail_registers -= 1;
            return Err(InteropError::Register(format!("surface {}", surface.id())));
        }
        s.next += 1;
        let handle = s.next;
        s.registrations.insert(
            handle,
            Registration {
                surface: surface.id(),
                locked: false,
            },
        );
        s.stats.registers += 1;
        trace!("SoftInterop: registered {} as {}", surface.id(), handle);
        Ok(InteropHandle(handle))
    }

    fn unregister(&self, handle: InteropHandle) {
        let mut s = self.lock_state();
        if s.registrations.remove(&handle.0).is_some() {
            s.stats.unregisters += 1;
        }
    }

    fn lock(&self, handle: InteropHandle) -> Result<(), InteropError> {
        let mut s = self.lock_state();
        let reg = s
            .registrations
            .get_mut(&handle.0)
            .ok_or(InteropError::UnknownHandle(handle.0))?;
        if reg.locked {
            return Err(InteropError::Lock(format!("handle {} already locked", handle.0)));
        }
        reg.locked = true;
        s.stats.locks += 1;
        Ok(())
    }

    fn unlock(&self, handle: InteropHandle) {
        let mut s = self.lock_state();
        if let Some(reg) = s.registrations.get_mut(&handle.0)
            && reg.locked
        {
            reg.locked = false;
            s.stats.unlocks += 1;
        }
    }
}
