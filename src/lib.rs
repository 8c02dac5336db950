//! PLAYOUT - timed video-frame presentation engine
//!
//! Decoded frames come in through a bounded pool, get presented against a
//! clock on a dedicated scheduler thread, and are published zero-copy to a
//! second graphics API. Re-exports all modules for use by the binary target.

// Core engine (pools, scheduler, present engine, session)
pub mod core;

// Graphics backends
pub mod backend;

// App modules
pub mod cli;
pub mod config;
pub mod paths;

// Re-export commonly used types from core
pub use config::EngineConfig;
pub use core::{
    ConsumerHandle, EngineEvent, EventBus, Frame, PresentError, PresentationSession, SessionState,
};
