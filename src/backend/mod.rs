//! Graphics backends implementing `Device` / `InteropApi`

pub mod soft;

pub use soft::{SoftDevice, SoftInterop};
