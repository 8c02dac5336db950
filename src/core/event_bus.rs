//! Engine event bus: informational and fatal notifications to the embedder.
//!
//! Architecture:
//! - Subscribers are invoked immediately on the emitting thread (often the
//!   scheduler thread - keep callbacks short and non-blocking)
//! - Every event is also queued for `poll()` from the control thread
//!
//! Every event carries the session id instead of a platform handle, so one
//! process can host several sessions without a global routing table.
//!
//! Callback order: FIFO (first-subscribed, first-called).

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use log::warn;
use uuid::Uuid;

use super::device::SurfaceDesc;
use super::frame::MediaTime;
use super::session::SessionState;

/// Maximum events in queue before oldest are evicted
const MAX_QUEUE_SIZE: usize = 1000;

/// Engine notifications
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A frame went back to the pool - decoder may produce another one
    NeedInput,
    /// New frame reached the screen
    FramePresented { serial: u64, timestamp: MediaTime },
    /// Frame presented after its quarter-frame tolerance
    LateFrame { serial: u64, lateness: MediaTime },
    /// Frame went back to the pool without reaching the screen (flushed,
    /// stale after a reset, failed present)
    FrameDropped { serial: u64 },
    /// Presenting a frame failed; scheduling continues
    PresentFailed { reason: String },
    /// Device was reset and recreated; pools now at `generation`
    DeviceReset { generation: u64 },
    /// Device removed - session is closing
    DeviceRemoved,
    /// Video format changed; pools invalidated
    FormatChanged { desc: SurfaceDesc, generation: u64 },
    /// Flush did not get an acknowledgement within its bound
    FlushTimedOut { waited: Duration },
    /// Frame-step finished on `serial`
    FrameStepComplete { serial: u64 },
    /// Frame-step aborted (stop/close) with `remaining` steps left
    FrameStepCancelled { remaining: u32 },
    /// Session state transition
    StateChanged { from: SessionState, to: SessionState },
}

/// Event tagged with its originating session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session: Uuid,
    pub event: EngineEvent,
}

/// Type-erased callback
type Callback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Pub/sub bus with deferred processing. Clones share state.
#[derive(Clone)]
pub struct EventBus {
    session: Uuid,
    subscribers: Arc<RwLock<Vec<Callback>>>,
    queue: Arc<Mutex<Vec<SessionEvent>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("session", &self.session)
            .field("subscribers", &self.subscribers.read().map(|s| s.len()).unwrap_or(0))
            .field("queue_len", &self.queue.lock().map(|q| q.len()).unwrap_or(0))
            .finish()
    }
}

impl EventBus {
    pub fn new(session: Uuid) -> Self {
        Self {
            session,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bus not tied to a session (standalone pools, tests)
    pub fn detached() -> Self {
        Self::new(Uuid::nil())
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Subscribe to all events. Callback runs on the emitting thread.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    /// Queue for `poll()`, then invoke subscribers.
    ///
    /// Queueing first keeps a follow-up event emitted from a callback behind
    /// its cause. The subscriber list is snapshotted so a callback may emit
    /// without re-entering the lock.
    pub fn emit(&self, event: EngineEvent) {
        let event = SessionEvent {
            session: self.session,
            event,
        };

        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= MAX_QUEUE_SIZE {
                let evict_count = queue.len() / 2;
                warn!("EventBus queue full ({} events), evicting oldest {}", queue.len(), evict_count);
                queue.drain(0..evict_count);
            }
            queue.push(event.clone());
        }

        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for cb in &callbacks {
            cb(&event);
        }
    }

    /// Take all events emitted since the last poll
    pub fn poll(&self) -> Vec<SessionEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Non-owning handle, for subscribers that emit follow-up events
    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            session: self.session,
            subscribers: Arc::downgrade(&self.subscribers),
            queue: Arc::downgrade(&self.queue),
        }
    }

    /// Drop all subscribers and queued events
    pub fn clear(&self) {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Weak counterpart of `EventBus` (a subscriber holding a strong clone
/// of its own bus would keep it alive forever)
#[derive(Clone)]
pub struct WeakEventBus {
    session: Uuid,
    subscribers: Weak<RwLock<Vec<Callback>>>,
    queue: Weak<Mutex<Vec<SessionEvent>>>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        Some(EventBus {
            session: self.session,
            subscribers: self.subscribers.upgrade()?,
            queue: self.queue.upgrade()?,
        })
    }
}
