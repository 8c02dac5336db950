//! Graphics API boundary: primary `Device` and secondary `InteropApi`
//!
//! **Why**: The engine owns the protocol (pooling, hand-off, device-loss
//! recovery), not a particular GPU API. A backend implements these two
//! traits; everything above them is API-agnostic.
//!
//! - `Device`: the primary API. Allocates surfaces, blits to the on-screen
//!   target, reports device loss. All methods take `&self`; implementations
//!   synchronize internally (free-threaded device model).
//! - `InteropApi`: the second API that consumes published surfaces zero-copy.
//!   Registration is expensive and done once per surface; lock/unlock is
//!   cheap and done on every use.
//!
//! `Surface` is move-only: whoever holds it owns the GPU resource and must
//! hand it back via `Device::destroy_surface`.

use dpi::{PhysicalPosition, PhysicalSize};

use super::error::{DeviceError, InteropError};

/// Backend-assigned surface identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl std::fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Surface pixel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Bgra8,
    Rgba8,
    Nv12,
    P010,
    Rgba16F,
}

impl PixelFormat {
    /// Bytes needed for a surface of this format
    pub fn buffer_size(&self, size: PhysicalSize<u32>) -> usize {
        let w = size.width as usize;
        let h = size.height as usize;
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => w * h * 4,
            PixelFormat::Nv12 => w * h * 3 / 2,
            PixelFormat::P010 => w * h * 3,
            PixelFormat::Rgba16F => w * h * 8,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "bgra8" => Some(PixelFormat::Bgra8),
            "rgba8" => Some(PixelFormat::Rgba8),
            "nv12" => Some(PixelFormat::Nv12),
            "p010" => Some(PixelFormat::P010),
            "rgba16f" => Some(PixelFormat::Rgba16F),
            _ => None,
        }
    }
}

/// Format-relevant surface parameters. Two surfaces are interchangeable
/// for pooling purposes iff their descriptors are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceDesc {
    pub size: PhysicalSize<u32>,
    pub format: PixelFormat,
}

impl SurfaceDesc {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            size: PhysicalSize::new(width, height),
            format,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.format.buffer_size(self.size)
    }

    pub fn is_empty(&self) -> bool {
        self.size.width == 0 || self.size.height == 0
    }
}

/// Owned GPU resource handle (not `Clone`: one owner at a time)
#[derive(Debug, PartialEq, Eq)]
pub struct Surface {
    id: SurfaceId,
    desc: SurfaceDesc,
}

impl Surface {
    /// Wrap a backend resource. Only backends should call this.
    pub fn new(id: SurfaceId, desc: SurfaceDesc) -> Self {
        Self { id, desc }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn desc(&self) -> &SurfaceDesc {
        &self.desc
    }
}

/// Destination rectangle on the on-screen target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestRect {
    pub origin: PhysicalPosition<i32>,
    pub size: PhysicalSize<u32>,
}

impl DestRect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            origin: PhysicalPosition::new(x, y),
            size: PhysicalSize::new(width, height),
        }
    }

    /// Rect covering a whole target of `size`
    pub fn full(size: PhysicalSize<u32>) -> Self {
        Self {
            origin: PhysicalPosition::new(0, 0),
            size,
        }
    }
}

/// Device health as reported by the primary API, and as returned by
/// `PresentEngine::check_device_state()` after recovery was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Device usable
    Ok,
    /// Device was (or must be) reset; dependent resources are invalid
    Reset,
    /// Device gone for good
    Removed,
}

/// Primary graphics API
pub trait Device: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Allocate a surface. The only operation allowed to block on GPU allocation.
    fn create_surface(&self, desc: &SurfaceDesc) -> Result<Surface, DeviceError>;

    /// Free a surface. Stale handles (from before a reset) are ignored.
    fn destroy_surface(&self, surface: Surface);

    /// Write pixel data into a surface (decoder side)
    fn upload(&self, surface: &Surface, data: &[u8]) -> Result<(), DeviceError>;

    /// GPU copy between surfaces with equal descriptors
    fn copy_surface(&self, src: &Surface, dst: &Surface) -> Result<(), DeviceError>;

    /// Scale/blit `src` onto the on-screen target at `dest`
    fn blit_to_target(&self, src: &Surface, dest: DestRect) -> Result<(), DeviceError>;

    /// Fill the whole target with a solid color
    fn clear_target(&self, color: [f32; 4]) -> Result<(), DeviceError>;

    /// Flip the target to screen
    fn present_target(&self) -> Result<(), DeviceError>;

    /// Reallocate the on-screen target
    fn resize_target(&self, size: PhysicalSize<u32>) -> Result<(), DeviceError>;

    /// Query device health. Cheap; called before every present.
    fn probe(&self) -> DeviceState;

    /// Recreate the device after `probe()` reported `Reset`.
    /// All surfaces created before this call become invalid.
    fn recreate(&self) -> Result<(), DeviceError>;
}

/// Secondary-API registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InteropHandle(pub u64);

/// Secondary graphics API (zero-copy consumer side)
pub trait InteropApi: Send + Sync {
    /// Register a primary surface with the consumer context (expensive, once)
    fn register(&self, surface: &Surface) -> Result<InteropHandle, InteropError>;

    /// Drop a registration (teardown / stale surfaces only)
    fn unregister(&self, handle: InteropHandle);

    /// Lock/map for consumer access (cheap, every use)
    fn lock(&self, handle: InteropHandle) -> Result<(), InteropError>;

    /// Unlock after the consumer is done
    fn unlock(&self, handle: InteropHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sizes() {
        let size = PhysicalSize::new(4, 2);
        assert_eq!(PixelFormat::Bgra8.buffer_size(size), 32);
        assert_eq!(PixelFormat::Nv12.buffer_size(size), 12);
        assert_eq!(PixelFormat::Rgba16F.buffer_size(size), 64);
    }

    #[test]
    fn test_desc_equality_drives_compatibility() {
        let a = SurfaceDesc::new(640, 360, PixelFormat::Nv12);
        let b = SurfaceDesc::new(640, 360, PixelFormat::Nv12);
        let c = SurfaceDesc::new(640, 360, PixelFormat::Bgra8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(SurfaceDesc::new(0, 10, PixelFormat::Bgra8).is_empty());
    }

    #[test]
    fn test_format_from_name() {
        assert_eq!(PixelFormat::from_name("NV12"), Some(PixelFormat::Nv12));
        assert_eq!(PixelFormat::from_name("yuv9"), None);
    }
}
