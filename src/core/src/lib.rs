//! Kiln Core - Foundational Types and Abstractions
//!
//! This module provides the foundational types shared across the kiln
//! image builder: the error taxonomy, the build event stream, and the
//! host task protocol.

pub mod error;
pub mod event;
pub mod task;

// Re-export commonly used types
pub use error::{KilnError, Result};
pub use event::{BuildEvent, EventSender};
pub use task::{
    ExtractRequest, ExtractSpec, HostTask, ImageRef, ReprovisionRequest, RunOutput, RunRequest,
    TarCompression, TaskReply,
};

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
