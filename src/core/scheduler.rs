//! Timed frame scheduler - dedicated thread presenting frames against a clock
//!
//! **Why**: Frames arrive from the decoder ahead of their presentation time.
//! The scheduler holds them in a pending queue and hands each one to the
//! present target when the presentation clock reaches its timestamp.
//!
//! # Timing (quarter-frame hysteresis)
//!
//! For the head frame: `delta = timestamp - clock` (negated in reverse),
//! `quarter = duration / 4`:
//!
//! - `delta < -quarter` → late, presented immediately
//! - `delta > 3 * quarter` → early, stays queued, thread sleeps `delta / |rate|`
//! - otherwise → on time, presented now
//!
//! Rate 0 (scrubbing) and missing clock present immediately.
//!
//! # Threading
//!
//! Control goes through a `crossbeam_channel` command channel (`Wake`,
//! `Flush`, `SetRate`, `Terminate`). The pending queue itself is shared
//! behind a mutex so `flush()` can drain it on the caller's thread; the
//! `Flush` acknowledgement then guarantees the thread is not mid-present of
//! a flushed frame.
//!
//! The present target is held weakly: the scheduler never keeps the engine
//! alive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};

use super::clock::PresentationClock;
use super::error::PresentError;
use super::event_bus::{EngineEvent, EventBus};
use super::frame::{Frame, MediaTime, frame_duration, media_to_wall};

/// Present target driven by the scheduler
pub trait Presentable: Send + Sync {
    /// Show `frame`, or re-present the last one when `None`
    fn present(&self, frame: Option<Frame>) -> Result<(), PresentError>;

    /// Return a frame that will never be shown (flush, shutdown)
    fn discard(&self, frame: Frame);
}

/// Outcome of a bounded flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Completed,
    /// Thread did not acknowledge in time; pending frames were still dropped
    TimedOut,
}

/// Where a frame sits relative to the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    /// Late by the given amount (positive)
    Late(MediaTime),
    OnTime,
    /// Early by the given amount
    Early(MediaTime),
}

/// Classify `delta = timestamp - clock` for a frame of `duration`.
///
/// Both boundaries are inclusive to "on time": `delta == 3 * quarter` and
/// `delta == -quarter` present now.
pub fn classify(delta: MediaTime, duration: MediaTime) -> Timing {
    let quarter = duration / 4;
    if delta < -quarter {
        Timing::Late(-delta)
    } else if delta > 3 * quarter {
        Timing::Early(delta)
    } else {
        Timing::OnTime
    }
}

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub thread_name: String,
    pub flush_timeout: Duration,
    /// Used for frames submitted without a duration
    pub nominal_duration: MediaTime,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: "playout-scheduler".to_string(),
            flush_timeout: Duration::from_millis(500),
            nominal_duration: frame_duration(30.0),
        }
    }
}

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub presented: u64,
    pub late: u64,
    pub early_waits: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    presented: AtomicU64,
    late: AtomicU64,
    early_waits: AtomicU64,
    failures: AtomicU64,
}

enum Command {
    Wake,
    Flush(Sender<()>),
    SetRate(f32),
    Terminate,
}

/// Result of one pass over the pending queue
enum Pass {
    Idle,
    Wait(Duration),
    Fatal,
}

struct Shared {
    target: Weak<dyn Presentable>,
    pending: Mutex<VecDeque<Frame>>,
    clock: RwLock<Option<Arc<dyn PresentationClock>>>,
    rate: Mutex<f32>,
    events: EventBus,
    counters: Counters,
    nominal_duration: MediaTime,
}

impl Shared {
    fn clock(&self) -> Option<Arc<dyn PresentationClock>> {
        self.clock.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn pop_front(&self) -> Option<Frame> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn drain(&self) -> Vec<Frame> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    /// Hand every pending frame back to the target
    fn discard_pending(&self) -> usize {
        let frames = self.drain();
        let count = frames.len();
        match self.target.upgrade() {
            Some(target) => frames.into_iter().for_each(|f| target.discard(f)),
            None => drop(frames),
        }
        count
    }

    /// Present one frame; `Err` only for fatal errors
    fn present(&self, target: &dyn Presentable, frame: Frame) -> Result<(), PresentError> {
        let serial = frame.serial();
        match target.present(Some(frame)) {
            Ok(()) => {
                self.counters.presented.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Scheduler: present of frame {} failed: {}", serial, e);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.events.emit(EngineEvent::PresentFailed {
                    reason: e.to_string(),
                });
                Ok(())
            }
        }
    }

    fn run_pass(&self, rate: f32) -> Pass {
        let Some(target) = self.target.upgrade() else {
            let dropped = self.drain().len();
            if dropped > 0 {
                debug!("Scheduler: target gone, dropping {} frames", dropped);
            }
            return Pass::Idle;
        };

        loop {
            let Some(frame) = self.pop_front() else {
                return Pass::Idle;
            };

            let timing = match self.clock() {
                Some(clock) if rate != 0.0 => {
                    let mut delta = frame.timestamp() - clock.time();
                    if rate < 0.0 {
                        delta = -delta;
                    }
                    let duration = if frame.duration() > 0 {
                        frame.duration()
                    } else {
                        self.nominal_duration
                    };
                    classify(delta, duration)
                }
                _ => Timing::OnTime,
            };

            match timing {
                Timing::Early(delta) => {
                    self.pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_front(frame);
                    self.counters.early_waits.fetch_add(1, Ordering::Relaxed);
                    return Pass::Wait(media_to_wall(delta, rate));
                }
                Timing::Late(lateness) => {
                    trace!("Scheduler: frame {} late by {} us", frame.serial(), lateness);
                    self.counters.late.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(EngineEvent::LateFrame {
                        serial: frame.serial(),
                        lateness,
                    });
                }
                Timing::OnTime => {}
            }

            if let Err(e) = self.present(target.as_ref(), frame) {
                error!("Scheduler: fatal present error: {}", e);
                let dropped = self.discard_pending();
                debug!("Scheduler: discarded {} pending frames after fatal error", dropped);
                return Pass::Fatal;
            }
        }
    }
}

fn scheduler_loop(shared: Arc<Shared>, rx: Receiver<Command>, mut rate: f32) {
    debug!("Scheduler thread started (rate {})", rate);
    let mut timeout: Option<Duration> = None;
    loop {
        let cmd = match timeout {
            Some(t) => rx.recv_timeout(t),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match cmd {
            Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Command::SetRate(r)) => rate = r,
            Ok(Command::Flush(ack)) => {
                shared.discard_pending();
                let _ = ack.send(());
            }
            Ok(Command::Terminate) | Err(RecvTimeoutError::Disconnected) => break,
        }

        timeout = match shared.run_pass(rate) {
            Pass::Idle => None,
            Pass::Wait(d) => Some(d),
            Pass::Fatal => break,
        };
    }
    debug!("Scheduler thread exiting");
}

/// Frame scheduler owning one presentation thread
pub struct Scheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    tx: Mutex<Option<Sender<Command>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("thread", &self.config.thread_name)
            .field("running", &self.is_running())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl Scheduler {
    pub fn new(target: Weak<dyn Presentable>, events: EventBus, config: SchedulerConfig) -> Self {
        let nominal_duration = config.nominal_duration.max(1);
        Self {
            shared: Arc::new(Shared {
                target,
                pending: Mutex::new(VecDeque::new()),
                clock: RwLock::new(None),
                rate: Mutex::new(1.0),
                events,
                counters: Counters::default(),
                nominal_duration,
            }),
            config,
            tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Attach (or detach) the presentation clock
    pub fn set_clock(&self, clock: Option<Arc<dyn PresentationClock>>) {
        *self.shared.clock.write().unwrap_or_else(|e| e.into_inner()) = clock;
        self.send(Command::Wake);
    }

    pub fn has_clock(&self) -> bool {
        self.shared.clock().is_some()
    }

    /// Spawn the scheduler thread. No-op if already running.
    pub fn start(&self) -> Result<(), PresentError> {
        let mut tx_slot = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx_slot.is_some() {
            return Ok(());
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::clone(&self.shared);
        let rate = self.rate();
        let handle = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || scheduler_loop(shared, rx, rate))
            .map_err(|e| {
                error!("Failed to spawn scheduler thread: {}", e);
                PresentError::SchedulerStart(e.to_string())
            })?;

        *tx_slot = Some(tx);
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!("Scheduler started: thread '{}'", self.config.thread_name);
        Ok(())
    }

    /// True while the thread is alive
    pub fn is_running(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_some()
            && self
                .handle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Queue a frame for timed presentation.
    ///
    /// `present_now`, no clock, or no running thread → presented on the
    /// caller's thread. Only fatal errors are returned.
    pub fn enqueue(&self, frame: Frame, present_now: bool) -> Result<(), PresentError> {
        if present_now || !self.has_clock() || !self.is_running() {
            return self.present_direct(frame);
        }

        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(frame);
        if !self.send(Command::Wake) {
            // Thread died between the check and the push
            if let Some(frame) = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_back()
            {
                return self.present_direct(frame);
            }
        }
        Ok(())
    }

    fn present_direct(&self, frame: Frame) -> Result<(), PresentError> {
        let Some(target) = self.shared.target.upgrade() else {
            debug!("Scheduler: target gone, dropping frame {}", frame.serial());
            return Ok(());
        };
        self.shared.present(target.as_ref(), frame)
    }

    /// Drop all pending frames and wait (bounded) until the thread is idle
    pub fn flush(&self) -> FlushStatus {
        let dropped = self.shared.discard_pending();
        trace!("Scheduler flush: {} pending frames discarded", dropped);

        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if !self.send(Command::Flush(ack_tx)) {
            return FlushStatus::Completed;
        }
        match ack_rx.recv_timeout(self.config.flush_timeout) {
            Ok(()) => FlushStatus::Completed,
            Err(RecvTimeoutError::Disconnected) => FlushStatus::Completed,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Scheduler flush not acknowledged within {} ms",
                    self.config.flush_timeout.as_millis()
                );
                self.shared.events.emit(EngineEvent::FlushTimedOut {
                    waited: self.config.flush_timeout,
                });
                FlushStatus::TimedOut
            }
        }
    }

    /// Change the sleep scale factor. Never flushes.
    pub fn set_rate(&self, rate: f32) {
        *self.shared.rate.lock().unwrap_or_else(|e| e.into_inner()) = rate;
        self.send(Command::SetRate(rate));
    }

    pub fn rate(&self) -> f32 {
        *self.shared.rate.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_len(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            presented: c.presented.load(Ordering::Relaxed),
            late: c.late.load(Ordering::Relaxed),
            early_waits: c.early_waits.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the thread, waiting at most `timeout`. Pending frames are
    /// discarded. Returns false if the thread did not exit in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(Command::Terminate);
        }
        self.shared.discard_pending();

        let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "Scheduler thread did not exit within {} ms, detaching",
                    timeout.as_millis()
                );
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = handle.join();
        debug!("Scheduler stopped");
        true
    }

    /// Returns false if the thread is not running
    fn send(&self, cmd: Command) -> bool {
        match self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown(Duration::from_millis(500));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{PixelFormat, Surface, SurfaceDesc, SurfaceId};
    use crate::core::error::DeviceError;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize};

    const FRAME: MediaTime = 33_333;

    /// Clock the test moves by hand
    struct ManualClock(AtomicI64);

    impl PresentationClock for ManualClock {
        fn time(&self) -> MediaTime {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct Recorder {
        presented: Mutex<Vec<(u64, Instant)>>,
        discarded: AtomicUsize,
        fail_next: AtomicBool,
        fatal: AtomicBool,
    }

    impl Presentable for Recorder {
        fn present(&self, frame: Option<Frame>) -> Result<(), PresentError> {
            if self.fatal.load(Ordering::SeqCst) {
                return Err(PresentError::DeviceRemoved);
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(PresentError::Device(DeviceError::Lost));
            }
            if let Some(f) = frame {
                self.presented.lock().unwrap().push((f.serial(), Instant::now()));
            }
            Ok(())
        }

        fn discard(&self, _frame: Frame) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Recorder {
        fn serials(&self) -> Vec<u64> {
            self.presented.lock().unwrap().iter().map(|(s, _)| *s).collect()
        }
    }

    fn frame(serial: u64, timestamp: MediaTime) -> Frame {
        let desc = SurfaceDesc::new(4, 4, PixelFormat::Bgra8);
        let mut f = Frame::new(Surface::new(SurfaceId(serial), desc), 1);
        f.stamp(serial);
        f.set_timing(timestamp, FRAME);
        f
    }

    fn setup() -> (Arc<Recorder>, Scheduler) {
        let rec = Arc::new(Recorder::default());
        let target: Arc<dyn Presentable> = rec.clone();
        let sched = Scheduler::new(
            Arc::downgrade(&target),
            EventBus::detached(),
            SchedulerConfig::default(),
        );
        (rec, sched)
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_classify_boundaries() {
        let d = 40_000; // quarter = 10_000
        assert_eq!(classify(30_000, d), Timing::OnTime);
        assert_eq!(classify(30_001, d), Timing::Early(30_001));
        assert_eq!(classify(-10_000, d), Timing::OnTime);
        assert_eq!(classify(-10_001, d), Timing::Late(10_001));
        assert_eq!(classify(0, d), Timing::OnTime);
    }

    #[test]
    fn test_no_clock_presents_immediately() {
        let (rec, sched) = setup();
        sched.start().unwrap();
        sched.enqueue(frame(1, 10_000_000), false).unwrap();
        assert_eq!(rec.serials(), vec![1]);
    }

    #[test]
    fn test_present_in_timestamp_order() {
        let (rec, sched) = setup();
        // Clock frozen at 0: nothing past 3/4 frame is due
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        sched.set_clock(Some(clock.clone()));
        sched.start().unwrap();

        for i in 0..5u64 {
            sched.enqueue(frame(i + 1, i as MediaTime * FRAME), false).unwrap();
        }
        wait_for(|| rec.serials().len() == 1);
        assert_eq!(rec.serials(), vec![1]);
        assert_eq!(sched.pending_len(), 4);

        clock.0.store(10 * FRAME, Ordering::SeqCst);
        sched.set_rate(1.0);
        wait_for(|| rec.serials().len() == 5);
        assert_eq!(rec.serials(), vec![1, 2, 3, 4, 5]);
        // everything was late once the clock jumped
        assert_eq!(sched.stats().late, 4);
    }

    #[test]
    fn test_early_frame_waits_for_its_time() {
        let (rec, sched) = setup();
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        sched.set_clock(Some(clock));
        sched.start().unwrap();

        let started = Instant::now();
        // 30 ms early, well past 3/4 of a frame
        sched.enqueue(frame(1, 30_000 + FRAME), false).unwrap();
        wait_for(|| !rec.serials().is_empty());
        let presented = rec.presented.lock().unwrap()[0].1;
        assert!(presented.duration_since(started) >= Duration::from_millis(30));
        assert!(sched.stats().early_waits >= 1);
    }

    #[test]
    fn test_reverse_presents_descending_timestamps() {
        let (rec, sched) = setup();
        let clock = Arc::new(ManualClock(AtomicI64::new(10 * FRAME)));
        sched.set_clock(Some(clock.clone()));
        sched.set_rate(-1.0);
        sched.start().unwrap();

        for (serial, t) in [(1, 10), (2, 9), (3, 8)] {
            sched.enqueue(frame(serial, t * FRAME), false).unwrap();
        }
        // 9F is a whole frame ahead of the clock in reverse
        wait_for(|| rec.serials().len() == 1 && sched.stats().early_waits >= 1);
        assert_eq!(rec.serials(), vec![1]);
        assert_eq!(sched.pending_len(), 2);

        clock.0.store(9 * FRAME, Ordering::SeqCst);
        sched.set_rate(-1.0);
        wait_for(|| rec.serials().len() == 2);
        assert_eq!(rec.serials(), vec![1, 2]);

        clock.0.store(8 * FRAME, Ordering::SeqCst);
        sched.set_rate(-1.0);
        wait_for(|| rec.serials().len() == 3);
        assert_eq!(rec.serials(), vec![1, 2, 3]);
        assert_eq!(sched.stats().late, 0);
    }

    #[test]
    fn test_reverse_early_sleep_scaled_by_rate() {
        let (rec, sched) = setup();
        let clock = Arc::new(ManualClock(AtomicI64::new(1_000_000)));
        sched.set_clock(Some(clock.clone()));
        sched.set_rate(-4.0);
        sched.start().unwrap();

        // 200 ms ahead in reverse: one sleep of 50 ms at 4x
        let started = Instant::now();
        sched.enqueue(frame(1, 800_000), false).unwrap();
        wait_for(|| sched.stats().early_waits >= 1);
        clock.0.store(800_000, Ordering::SeqCst);

        wait_for(|| !rec.serials().is_empty());
        let waited = rec.presented.lock().unwrap()[0].1.duration_since(started);
        assert!(waited >= Duration::from_millis(45), "woke after {:?}", waited);
        assert!(waited < Duration::from_millis(150), "woke after {:?}", waited);
        assert_eq!(classify(-(800_000 - 1_000_000), FRAME), Timing::Early(200_000));
    }

    #[test]
    fn test_rate_zero_presents_now() {
        let (rec, sched) = setup();
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        sched.set_clock(Some(clock));
        sched.set_rate(0.0);
        sched.start().unwrap();

        sched.enqueue(frame(1, 50 * FRAME), false).unwrap();
        wait_for(|| !rec.serials().is_empty());
        assert_eq!(rec.serials(), vec![1]);
    }

    #[test]
    fn test_flush_discards_pending() {
        let (rec, sched) = setup();
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        sched.set_clock(Some(clock));
        sched.start().unwrap();

        for i in 0..5u64 {
            sched.enqueue(frame(i + 1, (i as MediaTime + 10) * FRAME), false).unwrap();
        }
        assert_eq!(sched.flush(), FlushStatus::Completed);
        assert_eq!(sched.pending_len(), 0);
        assert_eq!(rec.discarded.load(Ordering::SeqCst), 5);
        assert!(rec.serials().is_empty());
    }

    #[test]
    fn test_failure_does_not_stop_loop() {
        let (rec, sched) = setup();
        sched.start().unwrap();
        rec.fail_next.store(true, Ordering::SeqCst);
        sched.enqueue(frame(1, 0), true).unwrap();
        sched.enqueue(frame(2, 0), true).unwrap();
        assert_eq!(rec.serials(), vec![2]);
        assert_eq!(sched.stats().failures, 1);
        assert!(sched.is_running());
    }

    #[test]
    fn test_fatal_error_propagates_and_stops_thread() {
        let (rec, sched) = setup();
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        sched.set_clock(Some(clock));
        sched.start().unwrap();

        rec.fatal.store(true, Ordering::SeqCst);
        assert_eq!(sched.enqueue(frame(1, 0), true), Err(PresentError::DeviceRemoved));

        sched.enqueue(frame(2, 0), false).unwrap();
        wait_for(|| !sched.is_running());
        assert!(!sched.is_running());
    }

    #[test]
    fn test_shutdown_bounded_and_idempotent() {
        let (_rec, sched) = setup();
        sched.start().unwrap();
        assert!(sched.is_running());
        assert!(sched.shutdown(Duration::from_millis(500)));
        assert!(!sched.is_running());
        assert!(sched.shutdown(Duration::from_millis(10)));
    }

    #[test]
    fn test_target_dropped_is_harmless() {
        let (rec, sched) = setup();
        sched.start().unwrap();
        drop(rec);
        sched.enqueue(frame(1, 0), true).unwrap();
        assert_eq!(sched.flush(), FlushStatus::Completed);
    }
}
