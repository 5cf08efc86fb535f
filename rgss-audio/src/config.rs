//! Audio engine configuration
//!
//! Loaded from TOML; every field has a built-in default so an empty file
//! (or no file at all) yields a working engine.
//!
//! # Settings Sources Priority
//!
//! 1. Explicit path (`--config`)
//! 2. Environment variable `RGSS_AUDIO_CONFIG`
//! 3. `<platform config dir>/rgss/audio.toml`
//! 4. Built-in defaults
//!
//! Out-of-range values are clamped with a warning rather than rejected.

use crate::error::Result;
use rgss_common::FadeCurve;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "RGSS_AUDIO_CONFIG";

/// Config file name inside the platform config directory
pub const CONFIG_FILE_NAME: &str = "audio.toml";

/// Maximum number of concurrent BGM tracks
pub const MAX_BGM_TRACKS: usize = 16;

/// Maximum number of one-shot voices
pub const MAX_SE_SOURCES: usize = 64;

/// Audio engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Concurrent background music tracks (1..=16)
    pub bgm_tracks: usize,

    /// Scale applied on top of every stream's volume composite
    pub global_volume: f32,

    /// Voices in the sound-effect pool (1..=64)
    pub se_source_count: usize,

    /// Byte budget of the decoded sound-effect cache
    pub se_cache_bytes: usize,

    pub midi: MidiConfig,

    pub output: OutputConfig,

    pub fade: FadeConfig,
}

/// Sequence (MIDI) backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Allow MIDI files to be opened at all
    pub enabled: bool,

    /// Simultaneous voices per synth instance
    pub polyphony: usize,

    /// Output gain of the synth
    pub gain: f32,
}

/// Output device settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Device name (None = system default)
    pub device: Option<String>,

    /// Run without audio hardware
    pub headless: bool,

    /// Mixing rate in Hz
    pub sample_rate: u32,

    /// Hardware buffer size in frames (None = device default)
    pub buffer_frames: Option<u32>,
}

/// Fade curve settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FadeConfig {
    /// Curve for script-requested fade-outs
    pub out_curve: FadeCurve,

    /// Curve for the automatic fade-in after resuming from an offset
    pub in_curve: FadeCurve,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            bgm_tracks: 1,
            global_volume: 0.8,
            se_source_count: 6,
            se_cache_bytes: 10 * 1024 * 1024,
            midi: MidiConfig::default(),
            output: OutputConfig::default(),
            fade: FadeConfig::default(),
        }
    }
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            polyphony: 48,
            gain: 0.5,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: None,
            headless: false,
            sample_rate: 44_100,
            buffer_frames: None,
        }
    }
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            out_curve: FadeCurve::Linear,
            in_curve: FadeCurve::Exponential,
        }
    }
}

impl AudioConfig {
    /// Parse TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AudioConfig = rgss_common::config::parse_toml(content)?;
        Ok(config.validated())
    }

    /// Load the config file resolved from `cli_path`, the environment, or
    /// the platform config dir; defaults when none exists.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let config: AudioConfig =
            rgss_common::config::load_or_default(cli_path, CONFIG_ENV_VAR, CONFIG_FILE_NAME)?;
        Ok(config.validated())
    }

    /// Clamp out-of-range values, warning about each one.
    pub fn validated(mut self) -> Self {
        if !(1..=MAX_BGM_TRACKS).contains(&self.bgm_tracks) {
            let clamped = self.bgm_tracks.clamp(1, MAX_BGM_TRACKS);
            warn!("bgm_tracks {} out of range, using {}", self.bgm_tracks, clamped);
            self.bgm_tracks = clamped;
        }

        if !(1..=MAX_SE_SOURCES).contains(&self.se_source_count) {
            let clamped = self.se_source_count.clamp(1, MAX_SE_SOURCES);
            warn!("se_source_count {} out of range, using {}", self.se_source_count, clamped);
            self.se_source_count = clamped;
        }

        if !self.global_volume.is_finite() || !(0.0..=1.0).contains(&self.global_volume) {
            let clamped = if self.global_volume.is_finite() {
                self.global_volume.clamp(0.0, 1.0)
            } else {
                0.8
            };
            warn!("global_volume {} out of range, using {}", self.global_volume, clamped);
            self.global_volume = clamped;
        }

        if self.midi.polyphony == 0 {
            warn!("midi.polyphony must be at least 1, using 1");
            self.midi.polyphony = 1;
        }

        if !self.midi.gain.is_finite() || self.midi.gain < 0.0 {
            warn!("midi.gain {} invalid, using 0.5", self.midi.gain);
            self.midi.gain = 0.5;
        }

        if !(8_000..=192_000).contains(&self.output.sample_rate) {
            let clamped = self.output.sample_rate.clamp(8_000, 192_000);
            warn!("output.sample_rate {} out of range, using {}", self.output.sample_rate, clamped);
            self.output.sample_rate = clamped;
        }

        self
    }
}
