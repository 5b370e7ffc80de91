//! vread-core - pipelined, seekable video-frame reader
//!
//! This crate turns a compressed video stream into decoded, color-converted,
//! resized image frames addressable by presentation timestamp, in either
//! playback direction, with bounded look-ahead/look-behind caching. It is
//! built for interactive playback and scrubbing: callers repeatedly ask for
//! "the frame nearest to time T" as a playhead moves, seeks and reverses.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │         Reader Facade                │
//! │  (lifecycle + frame lookup)          │
//! └─────────────────────────────────────┘
//!                  │ read position / direction / window
//!                  ▼
//! ┌──────────┐   packet   ┌──────────┐   frame   ┌──────────┐
//! │  Demux   │ ─ queue ─▶ │  Decode  │ ─ queue ─▶│ Convert  │
//! │ (thread) │            │ (thread) │           │ (thread) │
//! └──────────┘            └──────────┘           └──────────┘
//!   container seek          decoder flush          window eviction
//!   backpressure            ordered insert         hw -> host copy
//! ```
//!
//! The three stages run as named worker threads over shared, individually
//! locked queues; seeks and direction changes re-synchronize all of them
//! cooperatively without stalling the caller.

pub mod convert;
pub mod decode;
pub mod error;
pub mod frame;
pub mod queue;
pub mod reader;
pub mod source;
pub mod timestamp;

// Re-export main types
pub use convert::{
    ColorFormat, DataType, FrameConverter, Interpolation, OutputImage, OutputSize, OutputSpec,
};
pub use error::{Error, Result};
pub use frame::VideoFrame;
pub use reader::{ReadResult, ReaderTuning, VideoReader};
pub use source::{MediaSource, StreamDescriptor};
pub use timestamp::TickScale;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library (call once at startup)
pub fn init() {
    // Initialize logging with info level by default if RUST_LOG is not set
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).try_init();

    // FFmpeg initialization happens automatically when media is opened
    log::info!("vread-core {} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init() {
        init();
        // Should not panic
    }
}
