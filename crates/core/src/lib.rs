//! layerio core - stackable, buffered, encoding-aware I/O channels
//!
//! This crate provides:
//! - Channels over pluggable drivers, with transformation layers stacked on top
//! - Input/output buffering, end-of-line translation and character encodings
//! - A single-threaded event loop for readiness handlers and background work
//! - Background flushing and channel-to-channel copying
//! - Runtimes (execution contexts) and named registry scopes
//! - In-memory drivers for embedding and tests

// Version constants
pub const APP_VERSION_STRING: &str = "0.1.0";
pub const DRIVER_API_VERSION: u32 = 3;

pub mod buffer;
pub mod channel;
pub mod config;
pub mod copy;
pub mod driver;
pub mod encoding;
pub mod error;
pub mod notifier;
pub mod registry;
pub mod runtime;
pub mod transform;
pub mod translation;

// Re-export common types
pub use channel::{Channel, CloseCallbackId, HandlerId, CORE_OPTIONS};
pub use config::{Buffering, ChannelConfig};
pub use driver::{
    pipe, Below, ChannelDriver, Direction, DriverVersion, Interest, MemoryDriver, MemoryHandle,
    PipeDriver, RawHandle, SeekMode,
};
pub use encoding::Encoding;
pub use error::{ChannelError, Result};
pub use notifier::{ChannelWaker, Notifier, TimerToken};
pub use registry::Scope;
pub use runtime::{Runtime, StdStream};
pub use transform::{Transform, TransformDriver, TransformResult, TransformVerb};
pub use translation::{Translation, TranslationMode};
