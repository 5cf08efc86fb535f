//! Scripting-facing audio facade
//!
//! Owns every channel of the runtime:
//! - BGM: `bgm_tracks` looped streams, addressed by track index
//! - BGS: one looped ambience stream
//! - ME: one non-looped jingle stream, choreographed against the BGM
//! - SE: the cache-backed one-shot pool
//!
//! Volume and pitch are integer percentages; pitch 100 is unmodified.
//! Track arguments take an index or [`ALL_TRACKS`].

use crate::config::AudioConfig;
use crate::decoder::MidiState;
use crate::device::{AudioDevice, OutputDriver, OutputMode};
use crate::error::{Error, Result};
use crate::jingle_watch::{JingleWatch, JingleWatchThread, MeWatchState};
use crate::sound_emitter::SoundEmitter;
use crate::stream::{AudioStream, LoopMode};
use parking_lot::Mutex;
use rgss_common::FileSystem;
use std::sync::Arc;
use tracing::{info, warn};

/// Track argument addressing every BGM track
pub const ALL_TRACKS: i32 = -127;

/// Decoded track argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSelector {
    All,
    Index(usize),
}

impl TrackSelector {
    /// Validate a raw script argument against `count` tracks.
    pub fn resolve(raw: i32, count: usize) -> Result<Self> {
        if raw == ALL_TRACKS {
            return Ok(TrackSelector::All);
        }
        match usize::try_from(raw) {
            Ok(index) if index < count => Ok(TrackSelector::Index(index)),
            _ => Err(Error::InvalidTrack { index: raw, count }),
        }
    }
}

/// The audio subsystem of one game session.
pub struct Audio {
    // Declared first so it stops before the streams it ticks are dropped
    watch: Option<JingleWatchThread>,
    bgm: Vec<Arc<AudioStream>>,
    bgs: AudioStream,
    me: Arc<AudioStream>,
    se: Mutex<SoundEmitter>,
    midi: Arc<MidiState>,
    device: AudioDevice,
    output: Option<OutputDriver>,
    config: AudioConfig,
}

impl Audio {
    /// Build the subsystem and start the configured output backend.
    ///
    /// If the audio hardware cannot be opened, output falls back to the
    /// headless driver.
    pub fn new(config: AudioConfig, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let config = config.validated();
        let device = AudioDevice::new(config.output.sample_rate);

        let output = if config.output.headless {
            OutputDriver::start(device.clone(), OutputMode::Headless)?
        } else {
            let mode = OutputMode::Cpal {
                device_name: config.output.device.clone(),
                buffer_frames: config.output.buffer_frames,
            };
            match OutputDriver::start(device.clone(), mode) {
                Ok(driver) => driver,
                Err(e) => {
                    warn!("Audio hardware unavailable ({}), running headless", e);
                    OutputDriver::start(device.clone(), OutputMode::Headless)?
                }
            }
        };

        let mut audio = Self::build(config, fs, device)?;
        audio.output = Some(output);
        Ok(audio)
    }

    /// Build the subsystem over an existing device without starting any
    /// output; the caller is responsible for rendering `device`.
    pub fn with_device(config: AudioConfig, fs: Arc<dyn FileSystem>, device: AudioDevice) -> Result<Self> {
        Self::build(config.validated(), fs, device)
    }

    /// `config` must already be validated.
    fn build(config: AudioConfig, fs: Arc<dyn FileSystem>, device: AudioDevice) -> Result<Self> {
        // One synth per stream that may play MIDI, plus one for SE decoding
        let midi = Arc::new(MidiState::new(config.midi.clone(), config.bgm_tracks + 3));

        let stream = |name: &'static str, loop_mode: LoopMode| {
            AudioStream::new(
                name,
                device.clone(),
                loop_mode,
                Arc::clone(&fs),
                Arc::clone(&midi),
                config.global_volume,
                config.fade.clone(),
            )
        };

        let bgm: Vec<Arc<AudioStream>> = (0..config.bgm_tracks)
            .map(|_| Arc::new(stream("bgm", LoopMode::Looped)))
            .collect();
        let bgs = stream("bgs", LoopMode::Looped);
        let me = Arc::new(stream("me", LoopMode::NotLooped));
        let se = SoundEmitter::new(device.clone(), Arc::clone(&fs), Arc::clone(&midi), &config);

        let watch = JingleWatchThread::spawn(JingleWatch::new(bgm.clone(), Arc::clone(&me)))?;

        info!(
            "Audio initialized: {} BGM track(s), {} SE voices, {} byte SE cache",
            config.bgm_tracks, config.se_source_count, config.se_cache_bytes
        );

        Ok(Self {
            watch: Some(watch),
            bgm,
            bgs,
            me,
            se: Mutex::new(se),
            midi,
            device,
            output: None,
            config,
        })
    }

    fn tracks(&self, track: i32) -> Result<&[Arc<AudioStream>]> {
        match TrackSelector::resolve(track, self.bgm.len())? {
            TrackSelector::All => Ok(&self.bgm),
            TrackSelector::Index(i) => Ok(std::slice::from_ref(&self.bgm[i])),
        }
    }

    /// Single-track view of a selector; ALL reads track 0
    fn track(&self, track: i32) -> Result<&Arc<AudioStream>> {
        match TrackSelector::resolve(track, self.bgm.len())? {
            TrackSelector::All => Ok(&self.bgm[0]),
            TrackSelector::Index(i) => Ok(&self.bgm[i]),
        }
    }

    // ---------------------------------------------------------------
    // BGM
    // ---------------------------------------------------------------

    pub fn bgm_play(&self, path: &str, volume: i32, pitch: i32, pos: f32, track: i32) -> Result<()> {
        self.track(track)?.play(path, volume, pitch, pos)
    }

    pub fn bgm_stop(&self, track: i32) -> Result<()> {
        for stream in self.tracks(track)? {
            stream.stop();
        }
        Ok(())
    }

    pub fn bgm_fade(&self, time_ms: u32, track: i32) -> Result<()> {
        for stream in self.tracks(track)? {
            stream.fade_out(time_ms);
        }
        Ok(())
    }

    /// Playback position in seconds; ALL reports track 0.
    pub fn bgm_pos(&self, track: i32) -> Result<f32> {
        Ok(self.track(track)?.offset())
    }

    pub fn bgm_volume(&self, track: i32) -> Result<i32> {
        Ok(self.track(track)?.volume())
    }

    pub fn set_bgm_volume(&self, volume: i32, track: i32) -> Result<()> {
        for stream in self.tracks(track)? {
            stream.set_volume(volume);
        }
        Ok(())
    }

    pub fn bgm_track_count(&self) -> usize {
        self.bgm.len()
    }

    /// Stream behind a BGM track
    pub fn bgm_stream(&self, index: usize) -> Option<&Arc<AudioStream>> {
        self.bgm.get(index)
    }

    // ---------------------------------------------------------------
    // BGS
    // ---------------------------------------------------------------

    pub fn bgs_play(&self, path: &str, volume: i32, pitch: i32, pos: f32) -> Result<()> {
        self.bgs.play(path, volume, pitch, pos)
    }

    pub fn bgs_stop(&self) {
        self.bgs.stop();
    }

    pub fn bgs_fade(&self, time_ms: u32) {
        self.bgs.fade_out(time_ms);
    }

    pub fn bgs_pos(&self) -> f32 {
        self.bgs.offset()
    }

    pub fn bgs_volume(&self) -> i32 {
        self.bgs.volume()
    }

    pub fn set_bgs_volume(&self, volume: i32) {
        self.bgs.set_volume(volume);
    }

    pub fn bgs_stream(&self) -> &AudioStream {
        &self.bgs
    }

    // ---------------------------------------------------------------
    // ME
    // ---------------------------------------------------------------

    pub fn me_play(&self, path: &str, volume: i32, pitch: i32) -> Result<()> {
        self.me.play(path, volume, pitch, 0.0)
    }

    pub fn me_stop(&self) {
        self.me.stop();
    }

    pub fn me_fade(&self, time_ms: u32) {
        self.me.fade_out(time_ms);
    }

    pub fn me_volume(&self) -> i32 {
        self.me.volume()
    }

    pub fn set_me_volume(&self, volume: i32) {
        self.me.set_volume(volume);
    }

    pub fn me_stream(&self) -> &Arc<AudioStream> {
        &self.me
    }

    /// Current phase of the BGM/ME choreography
    pub fn jingle_state(&self) -> MeWatchState {
        self.watch
            .as_ref()
            .map_or(MeWatchState::MeNotPlaying, JingleWatchThread::state)
    }

    // ---------------------------------------------------------------
    // SE
    // ---------------------------------------------------------------

    /// Play a sound effect. Load failures are logged, never returned.
    pub fn se_play(&self, path: &str, volume: i32, pitch: i32) {
        self.se.lock().play(path, volume, pitch);
    }

    pub fn se_stop(&self) {
        self.se.lock().stop();
    }

    /// Run `f` against the sound-effect pool.
    pub fn with_se<R>(&self, f: impl FnOnce(&SoundEmitter) -> R) -> R {
        let se = self.se.lock();
        f(&se)
    }

    // ---------------------------------------------------------------
    // Global
    // ---------------------------------------------------------------

    /// Initialize the MIDI backend ahead of the first MIDI file.
    pub fn setup_midi(&self) -> Result<()> {
        self.midi.setup().map(|_| ())
    }

    /// Stop every channel.
    pub fn reset(&self) {
        for stream in &self.bgm {
            stream.stop();
        }
        self.bgs.stop();
        self.me.stop();
        self.se.lock().stop();
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Output backend, if this instance started one
    pub fn output_mode(&self) -> Option<&OutputMode> {
        self.output.as_ref().map(OutputDriver::mode)
    }
}

impl Drop for Audio {
    fn drop(&mut self) {
        self.watch.take();
        self.reset();
    }
}
