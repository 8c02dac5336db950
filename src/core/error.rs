//! Error types for the presentation engine
//!
//! Three layers, mirroring the three API surfaces:
//! - `DeviceError`: primary graphics API (allocation, blit, device loss)
//! - `InteropError`: secondary graphics API (registration, lock/map)
//! - `PresentError`: what the session and scheduler report to callers
//!
//! Transient conditions (pool empty, frame still early) are NOT errors -
//! they surface as `Ok(None)` / scheduler waits. Device reset is an event,
//! not an error. Only device removal and scheduler start failure are fatal.

use super::device::SurfaceId;
use super::session::SessionState;

/// Errors raised by a primary-API `Device` implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Device was reset; resources created before the reset are gone
    Lost,
    /// Device removed (driver crash, adapter unplugged) - unrecoverable
    Removed,
    /// Allocation failed
    OutOfMemory { bytes: usize },
    /// Surface handle unknown to the device (stale or already destroyed)
    InvalidSurface(SurfaceId),
    /// Source and destination descriptors do not match
    Incompatible(String),
    /// Backend-specific failure
    Backend(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Lost => write!(f, "Device lost"),
            DeviceError::Removed => write!(f, "Device removed"),
            DeviceError::OutOfMemory { bytes } => write!(f, "Out of GPU memory ({} bytes requested)", bytes),
            DeviceError::InvalidSurface(id) => write!(f, "Invalid surface: {}", id),
            DeviceError::Incompatible(e) => write!(f, "Incompatible surfaces: {}", e),
            DeviceError::Backend(e) => write!(f, "Device backend error: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Errors raised by a secondary-API `InteropApi` implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteropError {
    /// Registering the primary surface with the consumer context failed
    Register(String),
    /// Lock/map of a registered surface failed
    Lock(String),
    /// Registration handle unknown to the interop layer
    UnknownHandle(u64),
    /// Underlying primary device error surfaced through interop
    Device(DeviceError),
}

impl std::fmt::Display for InteropError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InteropError::Register(e) => write!(f, "Interop register failed: {}", e),
            InteropError::Lock(e) => write!(f, "Interop lock failed: {}", e),
            InteropError::UnknownHandle(h) => write!(f, "Unknown interop handle: {}", h),
            InteropError::Device(e) => write!(f, "Interop device error: {}", e),
        }
    }
}

impl std::error::Error for InteropError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InteropError::Device(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceError> for InteropError {
    fn from(e: DeviceError) -> Self {
        InteropError::Device(e)
    }
}

/// Errors reported by the engine to the session and its caller
#[derive(Debug, Clone, PartialEq)]
pub enum PresentError {
    /// Device removed - fatal for this session, caller must re-open from scratch
    DeviceRemoved,
    /// Scheduler thread could not be spawned - fatal to `open()`
    SchedulerStart(String),
    /// Operation not valid in the current session state
    InvalidState {
        op: &'static str,
        state: SessionState,
    },
    /// Frame-step requested while another step is in progress
    StepInProgress,
    /// Video format rejected (zero size, etc.)
    InvalidFormat(String),
    /// Non-fatal device failure while presenting a specific frame
    Device(DeviceError),
    /// Secondary API failure
    Interop(InteropError),
}

impl PresentError {
    /// Fatal errors close the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, PresentError::DeviceRemoved | PresentError::SchedulerStart(_))
    }
}

impl std::fmt::Display for PresentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresentError::DeviceRemoved => write!(f, "Device removed, session must be re-opened"),
            PresentError::SchedulerStart(e) => write!(f, "Failed to start scheduler thread: {}", e),
            PresentError::InvalidState { op, state } => {
                write!(f, "Cannot {} in state {:?}", op, state)
            }
            PresentError::StepInProgress => write!(f, "Frame step already in progress"),
            PresentError::InvalidFormat(e) => write!(f, "Invalid video format: {}", e),
            PresentError::Device(e) => write!(f, "Present failed: {}", e),
            PresentError::Interop(e) => write!(f, "Present failed: {}", e),
        }
    }
}

impl std::error::Error for PresentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PresentError::Device(e) => Some(e),
            PresentError::Interop(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceError> for PresentError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Removed => PresentError::DeviceRemoved,
            other => PresentError::Device(other),
        }
    }
}

impl From<InteropError> for PresentError {
    fn from(e: InteropError) -> Self {
        match e {
            InteropError::Device(DeviceError::Removed) => PresentError::DeviceRemoved,
            other => PresentError::Interop(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_maps_to_fatal() {
        let err: PresentError = DeviceError::Removed.into();
        assert_eq!(err, PresentError::DeviceRemoved);
        assert!(err.is_fatal());

        let err: PresentError = InteropError::Device(DeviceError::Removed).into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_transient_device_error_not_fatal() {
        let err: PresentError = DeviceError::OutOfMemory { bytes: 1024 }.into();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("1024"));
    }
}
