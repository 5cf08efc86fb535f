//! Streaming playback
//!
//! - [`engine`]: one hardware source fed by a filler thread
//! - [`audio_stream`]: volume compositing, fades and script parameters
//! - [`volume`]: the multiplier set behind a stream's gain

pub mod audio_stream;
pub mod engine;
pub mod volume;

pub use audio_stream::{AudioStream, StreamCore};
pub use engine::{LoopMode, StreamEngine, StreamState};
pub use volume::{VolumeComposite, VolumeKind};
