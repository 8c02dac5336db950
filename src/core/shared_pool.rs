//! Cross-API shared surface pool: free → ready → used
//!
//! **Why**: A second graphics API (the consumer) reads presented frames
//! zero-copy. Registering a surface with that API is expensive, so entries
//! are registered once and recycled; every use only pays a lock/unlock.
//!
//! # Lists
//!
//! - *free*: available (registered or not yet registered)
//! - *ready*: published, waiting for the consumer. Bounded: publishing past
//!   `ready_bound` moves the OLDEST ready entry back to *free*, so the
//!   consumer only ever sees recent frames.
//! - *used*: locked by a consumer. Each used entry tracks a weak reference to
//!   its `ConsumerHandle`.
//!
//! Each list has its own mutex; no code path holds two of them at once.
//!
//! # Teardown
//!
//! `ConsumerHandle` may be dropped on any thread, at any time - including
//! while the pool is shutting down or already gone. The handle holds only a
//! `Weak` back-reference to the pool plus a small link state shared with
//! the used slot:
//!
//! - `Attached`: normal case, drop → `pool.release()`
//! - `Orphaned(surface)`: pool shut down first; it unlocked and unregistered
//!   the entry and handed the surface to the handle, which destroys it on drop
//! - `Released`: handle drop already ran; if shutdown finds this, it destroys
//!   the surface itself

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, trace, warn};

use super::device::{Device, InteropApi, InteropHandle, Surface, SurfaceDesc, SurfaceId};
use super::error::{DeviceError, InteropError};
use super::frame::MediaTime;

/// Double buffering: one entry being read, one waiting
pub const DEFAULT_READY_BOUND: usize = 2;

/// Surface shared with the secondary API
#[derive(Debug)]
pub struct SharedSurfaceEntry {
    id: u64,
    surface: Surface,
    registration: Option<InteropHandle>,
    generation: u64,
    timestamp: MediaTime,
    serial: u64,
}

impl SharedSurfaceEntry {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn desc(&self) -> &SurfaceDesc {
        self.surface.desc()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Record which frame this entry now carries
    pub fn set_frame_info(&mut self, timestamp: MediaTime, serial: u64) {
        self.timestamp = timestamp;
        self.serial = serial;
    }
}

#[derive(Debug)]
enum LinkState {
    Attached,
    Released,
    Orphaned(Surface),
}

#[derive(Debug)]
struct HandleLink {
    state: Mutex<LinkState>,
}

struct UsedSlot {
    entry: SharedSurfaceEntry,
    handle: Weak<HandleLink>,
}

/// Pool counters
#[derive(Debug, Default)]
pub struct SharedPoolStats {
    allocations: AtomicU64,
    publishes: AtomicU64,
    evictions: AtomicU64,
    consumes: AtomicU64,
    releases: AtomicU64,
}

impl SharedPoolStats {
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn publishes(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }

    /// Ready entries dropped unread (bounded staleness)
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn consumes(&self) -> u64 {
        self.consumes.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}

/// Free/ready/used hand-off between the present engine and the consumer
pub struct SharedSurfacePool {
    device: Arc<dyn Device>,
    interop: Arc<dyn InteropApi>,
    free: Mutex<Vec<SharedSurfaceEntry>>,
    ready: Mutex<VecDeque<SharedSurfaceEntry>>,
    used: Mutex<HashMap<u64, UsedSlot>>,
    ready_bound: usize,
    generation: AtomicU64,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    stats: SharedPoolStats,
}

impl std::fmt::Debug for SharedSurfacePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (free, ready, used) = self.lens();
        f.debug_struct("SharedSurfacePool")
            .field("free", &free)
            .field("ready", &ready)
            .field("used", &used)
            .field("ready_bound", &self.ready_bound)
            .field("generation", &self.generation())
            .finish()
    }
}

impl SharedSurfacePool {
    /// `ready_bound` is clamped to at least 1
    pub fn new(device: Arc<dyn Device>, interop: Arc<dyn InteropApi>, ready_bound: usize) -> Arc<Self> {
        let ready_bound = ready_bound.max(1);
        debug!("SharedSurfacePool created: ready_bound={}", ready_bound);
        Arc::new(Self {
            device,
            interop,
            free: Mutex::new(Vec::new()),
            ready: Mutex::new(VecDeque::with_capacity(ready_bound + 1)),
            used: Mutex::new(HashMap::new()),
            ready_bound,
            generation: AtomicU64::new(1),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            stats: SharedPoolStats::default(),
        })
    }

    /// Compatible free entry, or a freshly allocated one.
    ///
    /// Allocation is the only path that may block on the GPU; registration
    /// with the secondary API is deferred to the first `consume()`.
    pub fn get_free(&self, desc: &SurfaceDesc) -> Result<SharedSurfaceEntry, DeviceError> {
        let generation = self.generation();
        {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(pos) = free
                .iter()
                .position(|e| e.desc() == desc && e.generation == generation)
            {
                return Ok(free.swap_remove(pos));
            }
        }

        let surface = self.device.create_surface(desc)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        trace!("SharedSurfacePool: allocated entry {} ({})", id, surface.id());
        Ok(SharedSurfaceEntry {
            id,
            surface,
            registration: None,
            generation,
            timestamp: 0,
            serial: 0,
        })
    }

    /// Make an entry visible to the consumer. Returns how many unread
    /// entries were pushed back to *free* to keep *ready* within its bound.
    pub fn publish(&self, entry: SharedSurfaceEntry) -> usize {
        let evicted: Vec<SharedSurfaceEntry> = {
            let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
            if self.is_retired(&entry) {
                drop(ready);
                self.destroy_entry(entry);
                return 0;
            }
            ready.push_back(entry);
            let mut evicted = Vec::new();
            while ready.len() > self.ready_bound {
                if let Some(oldest) = ready.pop_front() {
                    evicted.push(oldest);
                }
            }
            evicted
        };
        self.stats.publishes.fetch_add(1, Ordering::Relaxed);

        let count = evicted.len();
        if count > 0 {
            self.stats.evictions.fetch_add(count as u64, Ordering::Relaxed);
            trace!("SharedSurfacePool: {} unread entries recycled", count);
        }
        for e in evicted {
            self.return_to_free(e);
        }
        count
    }

    /// Give back an entry from `get_free()` that won't be published
    pub fn recycle(&self, entry: SharedSurfaceEntry) {
        self.return_to_free(entry);
    }

    /// Cheap non-blocking "is a new frame ready" check
    pub fn is_frame_ready(&self) -> bool {
        !self.ready.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Take the newest ready entry for the consumer.
    ///
    /// Registers on first use, locks on every use. Older ready entries are
    /// recycled: once the consumer has moved past them they'd only add latency.
    pub fn consume(self: &Arc<Self>) -> Result<Option<ConsumerHandle>, InteropError> {
        if self.is_shut_down() {
            return Ok(None);
        }

        let (mut entry, older) = {
            let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
            let Some(newest) = ready.pop_back() else {
                return Ok(None);
            };
            let older: Vec<SharedSurfaceEntry> = ready.drain(..).collect();
            (newest, older)
        };
        for e in older {
            self.return_to_free(e);
        }

        if entry.generation != self.generation() {
            self.destroy_entry(entry);
            return Ok(None);
        }

        let registration = match entry.registration {
            Some(h) => h,
            None => match self.interop.register(&entry.surface) {
                Ok(h) => {
                    entry.registration = Some(h);
                    h
                }
                Err(e) => {
                    warn!("SharedSurfacePool: register failed for entry {}: {}", entry.id, e);
                    self.return_to_free(entry);
                    return Err(e);
                }
            },
        };

        if let Err(e) = self.interop.lock(registration) {
            warn!("SharedSurfacePool: lock failed for entry {}: {}", entry.id, e);
            self.return_to_free(entry);
            return Err(e);
        }

        let link = Arc::new(HandleLink {
            state: Mutex::new(LinkState::Attached),
        });
        let handle = ConsumerHandle {
            pool: Arc::downgrade(self),
            device: Arc::clone(&self.device),
            link: Arc::clone(&link),
            entry_id: entry.id,
            registration,
            surface_id: entry.surface.id(),
            desc: *entry.surface.desc(),
            timestamp: entry.timestamp,
            serial: entry.serial,
        };
        {
            let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
            if self.is_shut_down() {
                drop(used);
                // shut down after the ready pop: the handle must not release
                *link.state.lock().unwrap_or_else(|e| e.into_inner()) = LinkState::Released;
                drop(handle);
                self.interop.unlock(registration);
                self.destroy_entry(entry);
                return Ok(None);
            }
            used.insert(
                entry.id,
                UsedSlot {
                    entry,
                    handle: Arc::downgrade(&link),
                },
            );
        }
        self.stats.consumes.fetch_add(1, Ordering::Relaxed);
        Ok(Some(handle))
    }

    /// Unlock a used entry and move it back to *free*.
    /// The secondary-API registration is kept for the next use.
    pub fn release(&self, entry_id: u64) {
        let slot = self
            .used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&entry_id);
        let Some(slot) = slot else {
            return;
        };
        let entry = slot.entry;
        if let Some(h) = entry.registration {
            self.interop.unlock(h);
        }
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        self.return_to_free(entry);
    }

    /// Bump generation and destroy everything not held by a consumer.
    /// Used entries are destroyed when their handle is released.
    pub fn invalidate(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let drained = self.drain_unused();
        let count = drained.len();
        for e in drained {
            self.destroy_entry(e);
        }
        debug!(
            "SharedSurfacePool invalidated: generation {}, destroyed {} entries",
            generation, count
        );
        generation
    }

    /// Tear down: unregister and destroy free/ready entries; unlock and
    /// unregister used entries and hand their surface to the consumer handle.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for e in self.drain_unused() {
            self.destroy_entry(e);
        }

        let used: Vec<UsedSlot> = self
            .used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let orphaned = used.len();
        for slot in used {
            let mut entry = slot.entry;
            if let Some(h) = entry.registration.take() {
                self.interop.unlock(h);
                self.interop.unregister(h);
            }
            match slot.handle.upgrade() {
                Some(link) => {
                    let mut state = link.state.lock().unwrap_or_else(|e| e.into_inner());
                    if matches!(*state, LinkState::Attached) {
                        *state = LinkState::Orphaned(entry.surface);
                    } else {
                        drop(state);
                        self.device.destroy_surface(entry.surface);
                    }
                }
                None => self.device.destroy_surface(entry.surface),
            }
        }
        info!("SharedSurfacePool shut down ({} entries still held by consumers)", orphaned);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn ready_bound(&self) -> usize {
        self.ready_bound
    }

    /// (free, ready, used) lengths
    pub fn lens(&self) -> (usize, usize, usize) {
        let free = self.free.lock().unwrap_or_else(|e| e.into_inner()).len();
        let ready = self.ready.lock().unwrap_or_else(|e| e.into_inner()).len();
        let used = self.used.lock().unwrap_or_else(|e| e.into_inner()).len();
        (free, ready, used)
    }

    pub fn stats(&self) -> &SharedPoolStats {
        &self.stats
    }

    fn drain_unused(&self) -> Vec<SharedSurfaceEntry> {
        let mut out: Vec<SharedSurfaceEntry> = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        out.extend(self.ready.lock().unwrap_or_else(|e| e.into_inner()).drain(..));
        out
    }

    /// True if `entry` must be destroyed instead of pooled. Callers check it
    /// while holding the list lock they push into: `shutdown`/`invalidate`
    /// flip their flag before draining under that same lock, so an entry
    /// can't slip in behind the drain.
    fn is_retired(&self, entry: &SharedSurfaceEntry) -> bool {
        self.is_shut_down() || entry.generation != self.generation()
    }

    fn return_to_free(&self, entry: SharedSurfaceEntry) {
        let retired = {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            if self.is_retired(&entry) {
                Some(entry)
            } else {
                free.push(entry);
                None
            }
        };
        if let Some(entry) = retired {
            self.destroy_entry(entry);
        }
    }

    fn destroy_entry(&self, entry: SharedSurfaceEntry) {
        if let Some(h) = entry.registration {
            self.interop.unregister(h);
        }
        trace!("SharedSurfacePool: destroying entry {}", entry.id);
        self.device.destroy_surface(entry.surface);
    }
}

impl Drop for SharedSurfacePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Consumer's view of a locked shared surface.
///
/// Dropping the handle releases it (unlock + back to *free*). Safe on any
/// thread, and safe after the pool was shut down or dropped.
pub struct ConsumerHandle {
    pool: Weak<SharedSurfacePool>,
    device: Arc<dyn Device>,
    link: Arc<HandleLink>,
    entry_id: u64,
    registration: InteropHandle,
    surface_id: SurfaceId,
    desc: SurfaceDesc,
    timestamp: MediaTime,
    serial: u64,
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("entry_id", &self.entry_id)
            .field("surface", &self.surface_id)
            .field("timestamp", &self.timestamp)
            .field("serial", &self.serial)
            .finish()
    }
}

impl ConsumerHandle {
    /// Secondary-API handle to sample from
    pub fn registration(&self) -> InteropHandle {
        self.registration
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.surface_id
    }

    pub fn desc(&self) -> &SurfaceDesc {
        &self.desc
    }

    /// Presentation timestamp of the frame this surface carries
    pub fn timestamp(&self) -> MediaTime {
        self.timestamp
    }

    /// Serial of the frame this surface carries
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn entry_id(&self) -> u64 {
        self.entry_id
    }

    /// Explicit release (same as drop)
    pub fn release(self) {}
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        let mut state = self.link.state.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *state, LinkState::Released) {
            LinkState::Attached => {
                drop(state);
                if let Some(pool) = self.pool.upgrade() {
                    pool.release(self.entry_id);
                }
            }
            LinkState::Orphaned(surface) => {
                drop(state);
                trace!("ConsumerHandle: destroying orphaned surface {}", surface.id());
                self.device.destroy_surface(surface);
            }
            LinkState::Released => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{SoftDevice, SoftInterop};
    use crate::core::device::PixelFormat;

    fn setup(bound: usize) -> (Arc<SoftDevice>, Arc<SoftInterop>, Arc<SharedSurfacePool>) {
        let device = Arc::new(SoftDevice::new());
        let interop = Arc::new(SoftInterop::new());
        let pool = SharedSurfacePool::new(device.clone(), interop.clone(), bound);
        (device, interop, pool)
    }

    fn desc() -> SurfaceDesc {
        SurfaceDesc::new(8, 8, PixelFormat::Bgra8)
    }

    fn publish_tagged(pool: &SharedSurfacePool, serial: u64) -> usize {
        let mut e = pool.get_free(&desc()).unwrap();
        e.set_frame_info(serial as MediaTime * 1000, serial);
        pool.publish(e)
    }

    #[test]
    fn test_ready_list_bounded_fifo_eviction() {
        let (_d, _i, pool) = setup(2);
        for serial in 1..=5 {
            publish_tagged(&pool, serial);
            assert!(pool.lens().1 <= 2);
        }
        assert_eq!(pool.stats().evictions(), 3);

        // Oldest dropped: the newest survives and is what the consumer gets
        let handle = pool.consume().unwrap().unwrap();
        assert_eq!(handle.serial(), 5);
    }

    #[test]
    fn test_consume_returns_newest_and_recycles_older() {
        let (_d, _i, pool) = setup(3);
        publish_tagged(&pool, 1);
        publish_tagged(&pool, 2);
        publish_tagged(&pool, 3);

        let handle = pool.consume().unwrap().unwrap();
        assert_eq!(handle.serial(), 3);
        let (free, ready, used) = pool.lens();
        assert_eq!((free, ready, used), (2, 0, 1));
        assert!(!pool.is_frame_ready());
    }

    #[test]
    fn test_consume_empty() {
        let (_d, _i, pool) = setup(2);
        assert!(pool.consume().unwrap().is_none());
    }

    #[test]
    fn test_register_once_lock_every_use() {
        let (device, interop, pool) = setup(2);
        for serial in 1..=4 {
            publish_tagged(&pool, serial);
            let handle = pool.consume().unwrap().unwrap();
            assert_eq!(interop.locked(), 1);
            drop(handle);
            assert_eq!(interop.locked(), 0);
        }
        let stats = interop.stats();
        assert_eq!(stats.registers, 1);
        assert_eq!(stats.locks, 4);
        assert_eq!(stats.unlocks, 4);
        assert_eq!(stats.unregisters, 0);
        assert_eq!(device.surfaces_created(), 1);
        assert_eq!(pool.lens(), (1, 0, 0));
    }

    #[test]
    fn test_incompatible_desc_allocates_new() {
        let (device, _i, pool) = setup(2);
        let e = pool.get_free(&desc()).unwrap();
        pool.publish(e);
        let h = pool.consume().unwrap().unwrap();
        drop(h);

        let other = SurfaceDesc::new(16, 16, PixelFormat::Bgra8);
        let e2 = pool.get_free(&other).unwrap();
        assert_eq!(e2.desc(), &other);
        assert_eq!(device.surfaces_created(), 2);
        pool.publish(e2);
    }

    #[test]
    fn test_invalidate_destroys_unused_and_stale_used_on_release() {
        let (device, interop, pool) = setup(2);
        publish_tagged(&pool, 1);
        let handle = pool.consume().unwrap().unwrap();
        publish_tagged(&pool, 2);
        assert_eq!(device.live_surfaces(), 2);

        pool.invalidate();
        // ready entry destroyed, used one still alive with the consumer
        assert_eq!(device.live_surfaces(), 1);
        assert_eq!(pool.lens(), (0, 0, 1));

        drop(handle);
        assert_eq!(device.live_surfaces(), 0);
        assert_eq!(interop.registered(), 0);
        assert_eq!(pool.lens(), (0, 0, 0));
    }

    #[test]
    fn test_shutdown_orphans_surface_to_live_handle() {
        let (device, interop, pool) = setup(2);
        publish_tagged(&pool, 1);
        publish_tagged(&pool, 2);
        let handle = pool.consume().unwrap().unwrap();

        pool.shutdown();
        // unlocked and unregistered, but surface kept alive for the handle
        assert_eq!(interop.locked(), 0);
        assert_eq!(interop.registered(), 0);
        assert_eq!(device.live_surfaces(), 1);

        drop(handle);
        assert_eq!(device.live_surfaces(), 0);
        assert!(pool.consume().unwrap().is_none());
    }

    #[test]
    fn test_handle_outlives_pool() {
        let (device, _i, pool) = setup(2);
        publish_tagged(&pool, 1);
        let handle = pool.consume().unwrap().unwrap();
        drop(pool);
        assert_eq!(device.live_surfaces(), 1);
        drop(handle);
        assert_eq!(device.live_surfaces(), 0);
    }

    #[test]
    fn test_handle_dropped_on_other_thread_during_shutdown() {
        for _ in 0..50 {
            let (device, _i, pool) = setup(2);
            publish_tagged(&pool, 1);
            let handle = pool.consume().unwrap().unwrap();
            let t = std::thread::spawn(move || drop(handle));
            pool.shutdown();
            t.join().unwrap();
            assert_eq!(device.live_surfaces(), 0);
        }
    }

    #[test]
    fn test_release_racing_shutdown_never_leaks() {
        for _ in 0..500 {
            let (device, interop, pool) = setup(2);
            publish_tagged(&pool, 1);
            publish_tagged(&pool, 2);
            let handle = pool.consume().unwrap().unwrap();

            let barrier = Arc::new(std::sync::Barrier::new(2));
            let b = Arc::clone(&barrier);
            let consumer = std::thread::spawn(move || {
                b.wait();
                drop(handle);
            });
            barrier.wait();
            pool.shutdown();
            consumer.join().unwrap();

            assert_eq!(pool.lens(), (0, 0, 0));
            drop(pool);
            assert_eq!(device.live_surfaces(), 0);
            assert_eq!(interop.registered(), 0);
            assert_eq!(interop.locked(), 0);
        }
    }

    #[test]
    fn test_entries_returned_after_shutdown_are_destroyed() {
        let (device, interop, pool) = setup(2);
        let entry = pool.get_free(&desc()).unwrap();
        publish_tagged(&pool, 1);
        let handle = pool.consume().unwrap().unwrap();
        pool.shutdown();

        pool.recycle(entry);
        publish_tagged(&pool, 2);
        assert_eq!(pool.lens(), (0, 0, 0));
        drop(handle);
        assert_eq!(device.live_surfaces(), 0);
        assert_eq!(interop.registered(), 0);
    }

    #[test]
    fn test_register_failure_returns_entry_to_free() {
        let (_d, interop, pool) = setup(2);
        publish_tagged(&pool, 1);
        interop.fail_registrations(1);
        assert!(pool.consume().is_err());
        assert_eq!(pool.lens(), (1, 0, 0));

        publish_tagged(&pool, 2);
        assert!(pool.consume().unwrap().is_some());
    }
}
