//! Sequence (MIDI) decoder
//!
//! Parses a standard MIDI file up front, then renders it chunk by chunk
//! through a synth leased from the shared [`SynthPool`]. Pitch is applied
//! natively by transposing notes, so the stream engine does not need to
//! speed up the voice. Controller 111 marks the loop start.

pub mod smf;
pub mod synth;

use super::{LoopPoints, PcmReader};
use crate::config::MidiConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rgss_common::ReadSeek;
use smf::{MidiEvent, Sequence};
use std::io::Read;
use std::sync::Arc;
use synth::{Synth, SynthLease, SynthPool, ToneSynth};
use tracing::{debug, info};

pub use synth::SynthFactory;

/// Rate the bundled synth renders at
pub const MIDI_SAMPLE_RATE: u32 = 44_100;

/// Silence appended after the last event so released notes can ring out
const RELEASE_TAIL_SECS: f64 = 0.15;

/// Largest transposition applied for native pitch, in semitones
const MAX_TRANSPOSE: i32 = 24;

/// Lazily created sequence backend shared by every channel.
pub struct MidiState {
    config: MidiConfig,
    capacity: usize,
    pool: Mutex<Option<Arc<SynthPool>>>,
}

impl MidiState {
    /// Backend with room for `capacity` simultaneous MIDI streams.
    pub fn new(config: MidiConfig, capacity: usize) -> Self {
        Self {
            config,
            capacity: capacity.max(1),
            pool: Mutex::new(None),
        }
    }

    /// Backend over a caller-provided synth pool.
    pub fn with_pool(config: MidiConfig, pool: Arc<SynthPool>) -> Self {
        Self {
            config,
            capacity: pool.capacity(),
            pool: Mutex::new(Some(pool)),
        }
    }

    pub fn config(&self) -> &MidiConfig {
        &self.config
    }

    /// Whether the synth pool has been created
    pub fn is_initialized(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Create the synth pool if needed and return it.
    pub fn setup(&self) -> Result<Arc<SynthPool>> {
        if !self.config.enabled {
            return Err(Error::Midi("MIDI playback is disabled".to_string()));
        }

        let mut pool = self.pool.lock();
        if let Some(pool) = pool.as_ref() {
            return Ok(Arc::clone(pool));
        }

        let polyphony = self.config.polyphony;
        let gain = self.config.gain;
        let created = SynthPool::new(
            self.capacity,
            Box::new(move || {
                Ok(Box::new(ToneSynth::new(MIDI_SAMPLE_RATE, polyphony, gain)) as Box<dyn Synth>)
            }),
        );
        info!(
            "MIDI backend initialized ({} synths, polyphony {})",
            self.capacity, polyphony
        );
        *pool = Some(Arc::clone(&created));
        Ok(created)
    }
}

/// Streaming renderer over a parsed MIDI file.
pub struct MidiReader {
    sequence: Sequence,
    synth: SynthLease,
    sample_rate: u32,
    total_frames: u64,
    position: u64,
    next_event: usize,
    transpose: i32,
}

impl MidiReader {
    /// Parse `reader` and lease a synth from `midi`'s pool.
    pub fn open(mut reader: Box<dyn ReadSeek>, midi: &MidiState) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        drop(reader);

        let pool = midi.setup()?;
        let synth = pool.acquire()?;
        let sample_rate = synth.sample_rate();
        let sequence = smf::parse(&data, sample_rate)?;

        let total_frames = sequence.length + (RELEASE_TAIL_SECS * sample_rate as f64) as u64;
        debug!(
            "MIDI sequence: {} events, {} frames, loop start {:?}",
            sequence.events.len(),
            total_frames,
            sequence.loop_start
        );

        Ok(Self {
            sequence,
            synth,
            sample_rate,
            total_frames,
            position: 0,
            next_event: 0,
            transpose: 0,
        })
    }

    fn transposed(&self, key: u8) -> u8 {
        (key as i32 + self.transpose).clamp(0, 127) as u8
    }

    fn dispatch(&mut self, event: MidiEvent) {
        match event {
            MidiEvent::NoteOn {
                channel,
                key,
                velocity,
            } => {
                let key = self.transposed(key);
                self.synth.note_on(channel, key, velocity);
            }
            MidiEvent::NoteOff { channel, key } => {
                let key = self.transposed(key);
                self.synth.note_off(channel, key);
            }
            MidiEvent::Controller {
                channel,
                controller,
                value,
            } => self.synth.control_change(channel, controller, value),
            MidiEvent::Program { channel, program } => self.synth.program_change(channel, program),
            MidiEvent::PitchBend { channel, value } => self.synth.pitch_bend(channel, value),
        }
    }
}

impl PcmReader for MidiReader {
    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.total_frames)
    }

    fn read(&mut self, out: &mut Vec<i16>, max_frames: usize) -> Result<usize> {
        let start = self.position;
        let target = (self.position + max_frames as u64).min(self.total_frames);

        while self.position < target {
            while let Some(timed) = self.sequence.events.get(self.next_event).copied() {
                if timed.frame > self.position {
                    break;
                }
                self.dispatch(timed.event);
                self.next_event += 1;
            }

            let until = self
                .sequence
                .events
                .get(self.next_event)
                .map_or(target, |e| e.frame.min(target));
            let frames = (until - self.position) as usize;
            self.synth.render(out, frames);
            self.position = until;
        }

        Ok((self.position - start) as usize)
    }

    fn seek_frame(&mut self, frame: u64) -> Result<()> {
        let target = frame.min(self.total_frames);
        self.synth.reset();

        let split = self.sequence.events.partition_point(|e| e.frame < target);
        for i in 0..split {
            let event = self.sequence.events[i].event;
            if event.is_state_change() {
                self.dispatch(event);
            }
        }

        self.next_event = split;
        self.position = target;
        Ok(())
    }

    fn loop_points(&self) -> LoopPoints {
        LoopPoints {
            start: self.sequence.loop_start.unwrap_or(0),
            end: None,
        }
    }

    fn set_pitch(&mut self, value: f32) -> bool {
        if value <= 0.0 {
            return false;
        }
        let semitones = (12.0 * value.log2()).round() as i32;
        let semitones = semitones.clamp(-MAX_TRANSPOSE, MAX_TRANSPOSE);
        if semitones != self.transpose {
            // Held notes were keyed with the old transposition
            for channel in 0..16 {
                self.synth.control_change(channel, 123, 0);
            }
            self.transpose = semitones;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::smf::build::smf;
    use super::*;
    use std::io::Cursor;

    fn state(capacity: usize) -> MidiState {
        MidiState::new(MidiConfig::default(), capacity)
    }

    fn open(data: Vec<u8>, midi: &MidiState) -> MidiReader {
        MidiReader::open(Box::new(Cursor::new(data)), midi).unwrap()
    }

    fn one_note() -> Vec<u8> {
        smf(&[(0, &[0x90, 69, 127]), (480, &[0x80, 69, 0])])
    }

    #[test]
    fn test_renders_stereo_for_song_length() {
        let midi = state(1);
        let mut reader = open(one_note(), &midi);
        let expected = (0.5 * MIDI_SAMPLE_RATE as f64) as u64
            + (RELEASE_TAIL_SECS * MIDI_SAMPLE_RATE as f64) as u64;
        assert_eq!(reader.total_frames(), Some(expected));

        let mut out = Vec::new();
        let mut frames = 0;
        loop {
            let n = reader.read(&mut out, 4096).unwrap();
            if n == 0 {
                break;
            }
            frames += n;
        }
        assert_eq!(frames as u64, expected);
        assert_eq!(out.len() as u64, expected * 2);
        assert!(out.iter().any(|s| s.unsigned_abs() > 500));
    }

    #[test]
    fn test_setup_is_lazy() {
        let midi = state(2);
        assert!(!midi.is_initialized());
        let _reader = open(one_note(), &midi);
        assert!(midi.is_initialized());
        let pool = midi.setup().unwrap();
        assert_eq!(pool.leased(), 1);
    }

    #[test]
    fn test_lease_returned_on_drop() {
        let midi = state(1);
        let reader = open(one_note(), &midi);
        assert!(MidiReader::open(Box::new(Cursor::new(one_note())), &midi).is_err());
        drop(reader);
        let _again = open(one_note(), &midi);
    }

    #[test]
    fn test_disabled_backend_rejects() {
        let config = MidiConfig {
            enabled: false,
            ..MidiConfig::default()
        };
        let midi = MidiState::new(config, 1);
        assert!(MidiReader::open(Box::new(Cursor::new(one_note())), &midi).is_err());
    }

    #[test]
    fn test_loop_marker_becomes_loop_start() {
        let midi = state(1);
        let data = smf(&[(0, &[0x90, 60, 100]), (480, &[0xB0, 111, 0]), (480, &[0x80, 60, 0])]);
        let reader = open(data, &midi);
        assert_eq!(reader.loop_points().start, (0.5 * MIDI_SAMPLE_RATE as f64) as u64);
    }

    #[test]
    fn test_pitch_is_native() {
        let midi = state(1);
        let mut reader = open(one_note(), &midi);
        assert!(reader.set_pitch(2.0));
        assert_eq!(reader.transpose, 12);
        assert_eq!(reader.transposed(60), 72);
        assert!(reader.set_pitch(0.5));
        assert_eq!(reader.transpose, -12);
    }

    #[test]
    fn test_seek_skips_notes_before_target() {
        let midi = state(1);
        let mut reader = open(one_note(), &midi);
        reader.seek_frame(30_000).unwrap();
        assert_eq!(reader.next_event, 2);
        let mut out = Vec::new();
        reader.read(&mut out, 100).unwrap();
        assert!(out.iter().all(|s| *s == 0));
    }
}
