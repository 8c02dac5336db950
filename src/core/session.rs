//! Presentation session - lifecycle, frame-step and the three boundaries
//!
//! **Why**: Owns one presentation pipeline (frame pool, present engine,
//! scheduler, optional shared pool) and the state machine around it. All
//! embedder calls go through here:
//!
//! - decoder: `acquire_frame()` / `submit_frame()`, paced by `NeedInput`
//! - control: `open`, `start`, `pause`, `stop`, `flush`, `step_frames`, `close`...
//! - consumer: `acquire_latest_frame()` / `is_frame_ready()`
//!
//! # State machine
//!
//! ```text
//! Closed → Ready → OpenPending → Started ⇄ Paused
//!                                   ↓  ↑      ↓
//!                                   Stopped ←─┘
//! any open state → Closing → Closed
//! ```
//!
//! `Ready` is transient inside `open()` (pools configured, scheduler not yet
//! running).
//!
//! # Frame-step
//!
//! `None → WaitingStart → Pending → Scheduled → Complete → None`. While
//! `Pending`, submitted frames count down the step; all but the last go
//! straight back to the pool, the last one is scheduled. Completion is
//! detected from the engine's `FramePresented` event. If the scheduled frame
//! is dropped instead (flush, stale after a reset, failed present), the step
//! goes back to `Pending` for one more frame.
//!
//! # Fatal errors
//!
//! `DeviceRemoved` (from any thread, via the event bus) sets a fatal flag.
//! The failing call, or the next one, closes the session and returns
//! `PresentError::DeviceRemoved`.
//!
//! Event callbacks run on engine threads and must not call control
//! operations on the session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use dpi::PhysicalSize;
use log::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::clock::PresentationClock;
use super::device::{DestRect, Device, InteropApi, SurfaceDesc};
use super::error::{DeviceError, PresentError};
use super::event_bus::{EngineEvent, EventBus};
use super::frame::Frame;
use super::frame_pool::FramePool;
use super::present::PresentEngine;
use super::scheduler::{FlushStatus, Presentable, Scheduler, SchedulerStats};
use super::shared_pool::{ConsumerHandle, SharedSurfacePool};
use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Closed,
    Ready,
    OpenPending,
    Started,
    Paused,
    Stopped,
    Closing,
}

impl SessionState {
    /// Pipeline exists and accepts frames
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionState::OpenPending
                | SessionState::Started
                | SessionState::Paused
                | SessionState::Stopped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStepState {
    None,
    /// Requested while not running; begins on the next `start()`
    WaitingStart,
    /// Counting down submitted frames
    Pending,
    /// Last frame handed to the scheduler
    Scheduled,
    Complete,
}

/// Outcome of a bounded `close()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Completed,
    /// Scheduler thread still running at the deadline; it was detached
    TimedOut,
}

#[derive(Debug)]
struct FrameStep {
    state: FrameStepState,
    remaining: u32,
    /// Frames submitted while `WaitingStart`
    queued: VecDeque<Frame>,
    scheduled: Option<u64>,
}

/// Where a submitted frame goes
enum StepRoute {
    Normal(Frame),
    Held,
    Skip(Frame),
    Last(Frame),
}

impl FrameStep {
    fn idle() -> Self {
        Self {
            state: FrameStepState::None,
            remaining: 0,
            queued: VecDeque::new(),
            scheduled: None,
        }
    }

    fn route(&mut self, frame: Frame) -> StepRoute {
        match self.state {
            FrameStepState::WaitingStart => {
                self.queued.push_back(frame);
                StepRoute::Held
            }
            FrameStepState::Pending => {
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining > 0 {
                    StepRoute::Skip(frame)
                } else {
                    self.state = FrameStepState::Scheduled;
                    self.scheduled = Some(frame.serial());
                    StepRoute::Last(frame)
                }
            }
            _ => StepRoute::Normal(frame),
        }
    }

    /// `WaitingStart → Pending`, returning the held frames
    fn begin(&mut self) -> Vec<Frame> {
        if self.state != FrameStepState::WaitingStart {
            return Vec::new();
        }
        self.state = FrameStepState::Pending;
        self.queued.drain(..).collect()
    }

    fn on_presented(&mut self, serial: u64) -> bool {
        if self.state == FrameStepState::Scheduled && self.scheduled == Some(serial) {
            self.state = FrameStepState::Complete;
            true
        } else {
            false
        }
    }

    /// The scheduled step frame was dropped before reaching the screen:
    /// `Scheduled → Pending`, the next submitted frame completes the step
    fn on_dropped(&mut self, serial: u64) -> bool {
        if self.state == FrameStepState::Scheduled && self.scheduled == Some(serial) {
            self.state = FrameStepState::Pending;
            self.remaining = 1;
            self.scheduled = None;
            true
        } else {
            false
        }
    }

    fn finish(&mut self) {
        if self.state == FrameStepState::Complete {
            *self = Self::idle();
        }
    }

    /// Abort an active step: (remaining, held frames)
    fn cancel(&mut self) -> Option<(u32, Vec<Frame>)> {
        if self.state == FrameStepState::None {
            return None;
        }
        let remaining = self.remaining;
        let frames = self.queued.drain(..).collect();
        *self = Self::idle();
        Some((remaining, frames))
    }
}

/// Per-open presentation machinery
struct Pipeline {
    engine: Arc<PresentEngine>,
    scheduler: Scheduler,
    shared: Option<Arc<SharedSurfacePool>>,
}

/// One presentation session
pub struct PresentationSession {
    id: Uuid,
    config: EngineConfig,
    device: Arc<dyn Device>,
    interop: Option<Arc<dyn InteropApi>>,
    events: EventBus,
    frame_pool: Arc<FramePool>,
    clock: RwLock<Option<Arc<dyn PresentationClock>>>,
    pipeline: RwLock<Option<Arc<Pipeline>>>,
    /// Serializes control operations
    control: Mutex<()>,
    state: Mutex<SessionState>,
    rate: Mutex<f32>,
    step: Arc<Mutex<FrameStep>>,
    fatal: Arc<AtomicBool>,
}

impl std::fmt::Debug for PresentationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("step", &self.step_state())
            .field("device", &self.device.name())
            .finish()
    }
}

impl PresentationSession {
    pub fn new(
        mut config: EngineConfig,
        device: Arc<dyn Device>,
        interop: Option<Arc<dyn InteropApi>>,
    ) -> Self {
        config.validate();
        let id = Uuid::new_v4();
        let events = EventBus::new(id);
        let frame_pool = Arc::new(FramePool::new(
            Arc::clone(&device),
            config.frame_pool_capacity,
            events.clone(),
        ));
        let step = Arc::new(Mutex::new(FrameStep::idle()));
        let fatal = Arc::new(AtomicBool::new(false));

        {
            let step = Arc::clone(&step);
            let fatal = Arc::clone(&fatal);
            let bus = events.downgrade();
            events.subscribe(move |ev| match &ev.event {
                EngineEvent::FramePresented { serial, .. } => {
                    let serial = *serial;
                    let done = step
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .on_presented(serial);
                    if done {
                        debug!("Frame step complete on frame {}", serial);
                        if let Some(bus) = bus.upgrade() {
                            bus.emit(EngineEvent::FrameStepComplete { serial });
                        }
                        step.lock().unwrap_or_else(|e| e.into_inner()).finish();
                    }
                }
                EngineEvent::FrameDropped { serial } => {
                    let rearmed = step
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .on_dropped(*serial);
                    if rearmed {
                        debug!("Frame step frame {} dropped, waiting for the next one", serial);
                    }
                }
                EngineEvent::DeviceRemoved => fatal.store(true, Ordering::Release),
                _ => {}
            });
        }

        info!(
            "Session {} created: device={}, interop={}",
            id,
            device.name(),
            interop.is_some()
        );
        Self {
            id,
            config,
            device,
            interop,
            events,
            frame_pool,
            clock: RwLock::new(None),
            pipeline: RwLock::new(None),
            control: Mutex::new(()),
            state: Mutex::new(SessionState::Closed),
            rate: Mutex::new(1.0),
            step,
            fatal,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn step_state(&self) -> FrameStepState {
        self.step.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Session event bus (subscribe or poll)
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rate(&self) -> f32 {
        *self.rate.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn frame_pool(&self) -> &Arc<FramePool> {
        &self.frame_pool
    }

    /// Present engine of the current open pipeline
    pub fn engine(&self) -> Option<Arc<PresentEngine>> {
        self.pipeline().map(|p| Arc::clone(&p.engine))
    }

    pub fn scheduler_stats(&self) -> Option<SchedulerStats> {
        self.pipeline().map(|p| p.scheduler.stats())
    }

    /// Frames waiting in the scheduler
    pub fn pending_frames(&self) -> usize {
        self.pipeline().map_or(0, |p| p.scheduler.pending_len())
    }

    /// Attach the presentation clock (kept across open/close)
    pub fn set_clock(&self, clock: Option<Arc<dyn PresentationClock>>) {
        *self.clock.write().unwrap_or_else(|e| e.into_inner()) = clock.clone();
        if let Some(p) = self.pipeline() {
            p.scheduler.set_clock(clock);
        }
    }

    fn clock(&self) -> Option<Arc<dyn PresentationClock>> {
        self.clock.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn open_pipeline(&self, op: &'static str) -> Result<Arc<Pipeline>, PresentError> {
        self.pipeline().ok_or(PresentError::InvalidState {
            op,
            state: self.state(),
        })
    }

    fn set_state(&self, to: SessionState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            info!("Session {}: {:?} -> {:?}", self.id, from, to);
            self.events.emit(EngineEvent::StateChanged { from, to });
        }
    }

    fn require_open(&self, op: &'static str) -> Result<SessionState, PresentError> {
        let state = self.state();
        if state.is_open() {
            Ok(state)
        } else {
            Err(PresentError::InvalidState { op, state })
        }
    }

    /// Close after a fatal error was observed. Caller must not hold `control`.
    fn check_fatal(&self) -> Result<(), PresentError> {
        if !self.fatal.load(Ordering::Acquire) {
            return Ok(());
        }
        if !matches!(self.state(), SessionState::Closed | SessionState::Closing) {
            warn!("Session {}: device removed, closing", self.id);
            let _ = self.close();
        }
        Err(PresentError::DeviceRemoved)
    }

    /// Route an error through fatal handling
    fn fail(&self, e: PresentError) -> PresentError {
        if e.is_fatal() {
            error!("Session {}: fatal error: {}", self.id, e);
            self.fatal.store(true, Ordering::Release);
            let _ = self.check_fatal();
        }
        e
    }

    /// Build the pipeline and start the scheduler: `Closed → Ready → OpenPending`
    pub fn open(&self, desc: SurfaceDesc) -> Result<(), PresentError> {
        let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.state();
        if state != SessionState::Closed {
            return Err(PresentError::InvalidState { op: "open", state });
        }
        self.fatal.store(false, Ordering::Release);
        self.set_state(SessionState::Ready);

        match self.build_pipeline(desc) {
            Ok(pipeline) => {
                *self.pipeline.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(pipeline));
                self.set_state(SessionState::OpenPending);
                Ok(())
            }
            Err(e) => {
                error!("Session {}: open failed: {}", self.id, e);
                self.set_state(SessionState::Closing);
                self.frame_pool.invalidate();
                self.set_state(SessionState::Closed);
                Err(e)
            }
        }
    }

    fn build_pipeline(&self, desc: SurfaceDesc) -> Result<Pipeline, PresentError> {
        let shared = self.interop.as_ref().map(|interop| {
            SharedSurfacePool::new(
                Arc::clone(&self.device),
                Arc::clone(interop),
                self.config.ready_bound,
            )
        });
        let engine = Arc::new(PresentEngine::new(
            Arc::clone(&self.device),
            Arc::clone(&self.frame_pool),
            shared.clone(),
            self.events.clone(),
            self.config.fallback_color,
        ));

        let shutdown_shared = |e: PresentError| {
            if let Some(s) = &shared {
                s.shutdown();
            }
            e
        };

        engine.set_video_format(desc).map_err(shutdown_shared)?;

        let target: Arc<dyn Presentable> = engine.clone();
        let scheduler = Scheduler::new(
            Arc::downgrade(&target),
            self.events.clone(),
            self.config.scheduler_config(),
        );
        scheduler.set_rate(self.rate());
        scheduler.set_clock(self.clock());
        scheduler.start().map_err(shutdown_shared)?;

        debug!("Session {}: pipeline ready for {:?}", self.id, desc);
        Ok(Pipeline {
            engine,
            scheduler,
            shared,
        })
    }

    /// Run at `rate`. Resolves a frame-step waiting for start.
    pub fn start(&self, rate: f32) -> Result<(), PresentError> {
        self.check_fatal()?;
        let held = {
            let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            let state = self.require_open("start")?;
            self.apply_rate(rate);
            if state != SessionState::Started {
                self.set_state(SessionState::Started);
            }
            self.step.lock().unwrap_or_else(|e| e.into_inner()).begin()
        };

        if !held.is_empty() {
            debug!("Session {}: delivering {} held step frames", self.id, held.len());
        }
        let mut held = held.into_iter();
        while let Some(frame) = held.next() {
            if let Err(e) = self.deliver(frame) {
                held.for_each(|f| self.frame_pool.release(f));
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn pause(&self) -> Result<(), PresentError> {
        self.check_fatal()?;
        let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        match self.state() {
            SessionState::Started => {
                self.set_state(SessionState::Paused);
                Ok(())
            }
            SessionState::Paused => Ok(()),
            state => Err(PresentError::InvalidState { op: "pause", state }),
        }
    }

    /// Flush, cancel any frame-step, `→ Stopped`
    pub fn stop(&self) -> Result<(), PresentError> {
        self.check_fatal()?;
        let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        self.require_open("stop")?;
        if let Some(p) = self.pipeline() {
            p.scheduler.flush();
        }
        self.cancel_step();
        self.set_state(SessionState::Stopped);
        Ok(())
    }

    /// Drop everything pending (scheduler queue and held step frames)
    pub fn flush(&self) -> Result<FlushStatus, PresentError> {
        self.check_fatal()?;
        let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        self.require_open("flush")?;
        let status = match self.pipeline() {
            Some(p) => p.scheduler.flush(),
            None => FlushStatus::Completed,
        };
        let held: Vec<Frame> = self
            .step
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queued
            .drain(..)
            .collect();
        for frame in held {
            self.frame_pool.release(frame);
        }
        Ok(status)
    }

    /// Present the `n`-th next submitted frame, dropping the ones before it
    pub fn step_frames(&self, n: u32) -> Result<(), PresentError> {
        self.check_fatal()?;
        let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.require_open("step_frames")?;
        if n == 0 {
            return Ok(());
        }
        let mut step = self.step.lock().unwrap_or_else(|e| e.into_inner());
        if step.state != FrameStepState::None {
            return Err(PresentError::StepInProgress);
        }
        step.remaining = n;
        step.state = if state == SessionState::Started {
            FrameStepState::Pending
        } else {
            FrameStepState::WaitingStart
        };
        debug!("Session {}: frame step {} ({:?})", self.id, n, step.state);
        Ok(())
    }

    fn cancel_step(&self) {
        let cancelled = self.step.lock().unwrap_or_else(|e| e.into_inner()).cancel();
        if let Some((remaining, held)) = cancelled {
            for frame in held {
                self.frame_pool.release(frame);
            }
            debug!("Session {}: frame step cancelled ({} remaining)", self.id, remaining);
            self.events.emit(EngineEvent::FrameStepCancelled { remaining });
        }
    }

    /// Decoder side: get a frame to decode into. `Ok(None)` = pool exhausted,
    /// retry after `NeedInput`.
    pub fn acquire_frame(&self) -> Result<Option<Frame>, PresentError> {
        self.check_fatal()?;
        self.require_open("acquire_frame")?;
        match self.frame_pool.acquire() {
            Ok(frame) => Ok(frame),
            Err(DeviceError::Lost) => {
                // Nothing presented since the reset: recover from here
                let engine = self.open_pipeline("acquire_frame")?.engine.clone();
                engine.check_device_state().map_err(|e| self.fail(e))?;
                match self.frame_pool.acquire() {
                    Ok(frame) => Ok(frame),
                    Err(DeviceError::Lost) => Ok(None),
                    Err(e) => Err(self.fail(e.into())),
                }
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Decoder side: hand a decoded frame over for presentation
    pub fn submit_frame(&self, frame: Frame) -> Result<(), PresentError> {
        if let Err(e) = self.check_fatal().and_then(|_| self.require_open("submit_frame")) {
            self.frame_pool.release(frame);
            return Err(e);
        }
        trace!(
            "Session {}: submit frame {} @ {} us",
            self.id,
            frame.serial(),
            frame.timestamp()
        );
        self.deliver(frame)
    }

    fn deliver(&self, frame: Frame) -> Result<(), PresentError> {
        let route = self.step.lock().unwrap_or_else(|e| e.into_inner()).route(frame);
        match route {
            StepRoute::Held => Ok(()),
            StepRoute::Skip(frame) => {
                trace!("Session {}: frame {} skipped by step", self.id, frame.serial());
                self.frame_pool.release(frame);
                Ok(())
            }
            StepRoute::Last(frame) => {
                let scrubbing = self.rate() == 0.0;
                self.schedule(frame, scrubbing)
            }
            StepRoute::Normal(frame) => self.schedule(frame, false),
        }
    }

    fn schedule(&self, frame: Frame, present_now: bool) -> Result<(), PresentError> {
        let Some(p) = self.pipeline() else {
            self.frame_pool.release(frame);
            return Err(PresentError::InvalidState {
                op: "submit_frame",
                state: self.state(),
            });
        };
        p.scheduler
            .enqueue(frame, present_now)
            .map_err(|e| self.fail(e))
    }

    /// Consumer side: newest published surface, if any
    pub fn acquire_latest_frame(&self) -> Result<Option<ConsumerHandle>, PresentError> {
        let Some(shared) = self.pipeline().and_then(|p| p.shared.clone()) else {
            return Ok(None);
        };
        shared.consume().map_err(|e| self.fail(e.into()))
    }

    /// Consumer side: cheap readiness check
    pub fn is_frame_ready(&self) -> bool {
        self.pipeline()
            .and_then(|p| p.shared.clone())
            .is_some_and(|s| s.is_frame_ready())
    }

    /// Change the decoded-frame format mid-stream
    pub fn set_video_format(&self, desc: SurfaceDesc) -> Result<bool, PresentError> {
        self.check_fatal()?;
        self.require_open("set_video_format")?;
        self.open_pipeline("set_video_format")?
            .engine
            .set_video_format(desc)
    }

    pub fn set_destination_rect(&self, rect: DestRect) -> Result<(), PresentError> {
        self.check_fatal()?;
        self.open_pipeline("set_destination_rect")?
            .engine
            .set_destination_rect(rect);
        Ok(())
    }

    pub fn resize_target(&self, size: PhysicalSize<u32>) -> Result<bool, PresentError> {
        self.check_fatal()?;
        let engine = self.open_pipeline("resize_target")?.engine.clone();
        engine.resize_target(size).map_err(|e| self.fail(e))
    }

    /// Playback rate; negative is reverse, 0 is scrubbing. Never flushes.
    pub fn set_rate(&self, rate: f32) -> Result<(), PresentError> {
        self.check_fatal()?;
        self.apply_rate(rate);
        Ok(())
    }

    fn apply_rate(&self, rate: f32) {
        *self.rate.lock().unwrap_or_else(|e| e.into_inner()) = rate;
        if let Some(p) = self.pipeline() {
            p.scheduler.set_rate(rate);
        }
    }

    /// Re-present the current frame (expose / resize)
    pub fn repaint(&self) -> Result<(), PresentError> {
        self.check_fatal()?;
        self.require_open("repaint")?;
        let engine = self.open_pipeline("repaint")?.engine.clone();
        engine.present(None).map_err(|e| self.fail(e))
    }

    /// Tear the pipeline down, bounded by `close_timeout`
    pub fn close(&self) -> Result<CloseStatus, PresentError> {
        let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if self.state() == SessionState::Closed {
            return Ok(CloseStatus::Completed);
        }
        let started = Instant::now();
        self.set_state(SessionState::Closing);

        let pipeline = self.pipeline.write().unwrap_or_else(|e| e.into_inner()).take();
        let mut status = CloseStatus::Completed;
        match pipeline {
            Some(p) => {
                p.scheduler.flush();
                self.cancel_step();
                let budget = self.config.close_timeout().saturating_sub(started.elapsed());
                if !p.scheduler.shutdown(budget) {
                    warn!(
                        "Session {}: close exceeded {} ms",
                        self.id, self.config.close_timeout_ms
                    );
                    status = CloseStatus::TimedOut;
                }
                p.engine.shutdown();
                if let Some(shared) = &p.shared {
                    shared.shutdown();
                }
            }
            None => self.cancel_step(),
        }
        self.frame_pool.invalidate();
        self.set_state(SessionState::Closed);
        debug!(
            "Session {}: closed in {} ms",
            self.id,
            started.elapsed().as_millis()
        );
        Ok(status)
    }
}

impl Drop for PresentationSession {
    fn drop(&mut self) {
        if self.state() != SessionState::Closed {
            let _ = self.close();
        }
    }
}
