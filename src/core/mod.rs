//! Core engine modules - frames, pools, scheduling, presentation, session
//!
//! Independent of any concrete graphics API: backends plug in through the
//! `Device` / `InteropApi` traits in `device`.

pub mod clock;
pub mod device;
pub mod error;
pub mod event_bus;
pub mod frame;
pub mod frame_pool;
pub mod present;
pub mod scheduler;
pub mod session;
pub mod shared_pool;

// Re-exports for convenience
pub use clock::{PresentationClock, SystemClock};
pub use device::{
    DestRect, Device, DeviceState, InteropApi, InteropHandle, PixelFormat, Surface, SurfaceDesc,
    SurfaceId,
};
pub use error::{DeviceError, InteropError, PresentError};
pub use event_bus::{EngineEvent, EventBus, SessionEvent};
pub use frame::{Frame, MediaTime, frame_duration};
pub use frame_pool::FramePool;
pub use present::PresentEngine;
pub use scheduler::{FlushStatus, Presentable, Scheduler, SchedulerStats};
pub use session::{CloseStatus, FrameStepState, PresentationSession, SessionState};
pub use shared_pool::{ConsumerHandle, SharedSurfacePool};
