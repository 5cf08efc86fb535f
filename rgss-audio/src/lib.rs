//! # RGSS Audio (rgss-audio)
//!
//! Streaming audio engine for an RGSS game runtime.
//!
//! **Purpose:** Play background music (BGM), ambience (BGS), jingles (ME)
//! and sound effects (SE) from a virtual filesystem, with fades, loop
//! points and ducking of the music around jingles.
//!
//! **Architecture:**
//! - `device`: software buffer-queue device (sources, buffers, mixing) and
//!   its cpal/headless output drivers
//! - `decoder`: format-sniffed decoders (symphonia, hound, MIDI synth)
//! - `stream`: background-filled streams with volume compositing and fades
//! - `sound_emitter`: cache-backed one-shot voice pool
//! - `jingle_watch`: BGM/ME choreographer
//! - `audio`: the facade scripts talk to

pub mod audio;
pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod jingle_watch;
pub mod sound_emitter;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_util;

pub use audio::{Audio, TrackSelector, ALL_TRACKS};
pub use config::AudioConfig;
pub use error::{Error, Result};
pub use jingle_watch::MeWatchState;
pub use stream::{StreamState, VolumeKind};
