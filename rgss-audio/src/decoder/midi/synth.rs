//! Synthesizer backends for the sequence decoder
//!
//! [`Synth`] is the seam between the MIDI timeline and whatever renders it.
//! The bundled [`ToneSynth`] is a small polyphonic oscillator synth with
//! per-channel volume, expression, pan and pitch bend; the General MIDI
//! program only selects a waveform family.
//!
//! Synth instances are expensive to set up in real backends, so they come
//! from a fixed-size [`SynthPool`] and are returned to it when the
//! [`SynthLease`] drops.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::f32::consts::TAU;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, trace};

/// MIDI channel reserved for percussion
const DRUM_CHANNEL: u8 = 9;

/// Renders MIDI channel events to interleaved stereo 16-bit PCM.
pub trait Synth: Send {
    /// Silence every voice and restore controller defaults
    fn reset(&mut self);

    fn note_on(&mut self, channel: u8, key: u8, velocity: u8);

    fn note_off(&mut self, channel: u8, key: u8);

    fn control_change(&mut self, channel: u8, controller: u8, value: u8);

    fn program_change(&mut self, channel: u8, program: u8);

    /// `value` is centred on 0 (-8192..=8191)
    fn pitch_bend(&mut self, channel: u8, value: i16);

    /// Append `frames` stereo frames to `out`
    fn render(&mut self, out: &mut Vec<i16>, frames: usize);

    /// Output sample rate
    fn sample_rate(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waveform {
    Sine,
    Square,
    Saw,
    Triangle,
    Noise,
}

impl Waveform {
    /// Rough General MIDI family mapping
    fn for_program(program: u8) -> Self {
        match program {
            0..=7 => Waveform::Triangle,      // pianos
            8..=23 => Waveform::Sine,         // chromatic percussion, organs
            24..=39 => Waveform::Saw,         // guitars, basses
            40..=55 => Waveform::Saw,         // strings, ensembles
            56..=79 => Waveform::Square,      // brass, reeds, pipes
            80..=103 => Waveform::Square,     // synth leads and pads
            _ => Waveform::Triangle,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelState {
    program: u8,
    volume: f32,
    expression: f32,
    pan: f32,
    /// Bend in semitones
    bend: f32,
    sustain: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            program: 0,
            volume: 100.0 / 127.0,
            expression: 1.0,
            pan: 0.5,
            bend: 0.0,
            sustain: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    channel: u8,
    key: u8,
    velocity: f32,
    waveform: Waveform,
    phase: f32,
    envelope: f32,
    released: bool,
    /// Held by the sustain pedal after note-off
    sustained: bool,
    age: u64,
    noise_state: u32,
}

impl Voice {
    fn frequency(&self, bend: f32) -> f32 {
        440.0 * 2f32.powf((self.key as f32 - 69.0 + bend) / 12.0)
    }

    fn sample(&mut self) -> f32 {
        let value = match self.waveform {
            Waveform::Sine => (self.phase * TAU).sin(),
            Waveform::Square => {
                if self.phase < 0.5 {
                    0.6
                } else {
                    -0.6
                }
            }
            Waveform::Saw => 2.0 * self.phase - 1.0,
            Waveform::Triangle => 1.0 - 4.0 * (self.phase - 0.5).abs(),
            Waveform::Noise => {
                // xorshift32
                let mut x = self.noise_state;
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                self.noise_state = x;
                (x as f32 / u32::MAX as f32) * 2.0 - 1.0
            }
        };
        value * self.envelope * self.velocity
    }
}

/// Small polyphonic oscillator synthesizer.
pub struct ToneSynth {
    sample_rate: u32,
    gain: f32,
    polyphony: usize,
    channels: [ChannelState; 16],
    voices: Vec<Voice>,
    clock: u64,
    attack_step: f32,
    release_step: f32,
    drum_decay: f32,
}

impl ToneSynth {
    pub fn new(sample_rate: u32, polyphony: usize, gain: f32) -> Self {
        let rate = sample_rate.max(1) as f32;
        Self {
            sample_rate: sample_rate.max(1),
            gain,
            polyphony: polyphony.max(1),
            channels: [ChannelState::default(); 16],
            voices: Vec::with_capacity(polyphony),
            clock: 0,
            // 5 ms attack, 120 ms release, 150 ms drum decay
            attack_step: 1.0 / (0.005 * rate),
            release_step: 1.0 / (0.120 * rate),
            drum_decay: (-1.0 / (0.150 * rate)).exp(),
        }
    }

    /// Voices currently sounding
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    fn release(&mut self, channel: u8, key: Option<u8>) {
        let sustain = self.channels[channel as usize & 0x0F].sustain;
        for voice in self
            .voices
            .iter_mut()
            .filter(|v| v.channel == channel && key.map_or(true, |k| v.key == k))
        {
            if sustain && key.is_some() {
                voice.sustained = true;
            } else {
                voice.released = true;
            }
        }
    }
}

impl Synth for ToneSynth {
    fn reset(&mut self) {
        self.voices.clear();
        self.channels = [ChannelState::default(); 16];
    }

    fn note_on(&mut self, channel: u8, key: u8, velocity: u8) {
        let channel = channel & 0x0F;
        if self.voices.len() >= self.polyphony {
            // Steal the oldest voice
            if let Some(oldest) = self
                .voices
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.age)
                .map(|(i, _)| i)
            {
                self.voices.swap_remove(oldest);
            }
        }

        let waveform = if channel == DRUM_CHANNEL {
            Waveform::Noise
        } else {
            Waveform::for_program(self.channels[channel as usize].program)
        };
        self.clock += 1;
        self.voices.push(Voice {
            channel,
            key,
            velocity: velocity as f32 / 127.0,
            waveform,
            phase: 0.0,
            envelope: if channel == DRUM_CHANNEL { 1.0 } else { 0.0 },
            released: false,
            sustained: false,
            age: self.clock,
            noise_state: 0x9E37_79B9 ^ (key as u32) << 8 | 1,
        });
    }

    fn note_off(&mut self, channel: u8, key: u8) {
        self.release(channel & 0x0F, Some(key));
    }

    fn control_change(&mut self, channel: u8, controller: u8, value: u8) {
        let channel = channel & 0x0F;
        let state = &mut self.channels[channel as usize];
        let norm = value as f32 / 127.0;
        match controller {
            7 => state.volume = norm,
            10 => state.pan = norm,
            11 => state.expression = norm,
            64 => {
                state.sustain = value >= 64;
                if !state.sustain {
                    for voice in self.voices.iter_mut().filter(|v| v.channel == channel && v.sustained) {
                        voice.released = true;
                    }
                }
            }
            // All sound off / all notes off
            120 => self.voices.retain(|v| v.channel != channel),
            123 => self.release(channel, None),
            121 => {
                *state = ChannelState {
                    program: state.program,
                    ..ChannelState::default()
                };
            }
            _ => trace!("Ignoring controller {} on channel {}", controller, channel),
        }
    }

    fn program_change(&mut self, channel: u8, program: u8) {
        self.channels[channel as usize & 0x0F].program = program;
    }

    fn pitch_bend(&mut self, channel: u8, value: i16) {
        // Default bend range of +-2 semitones
        self.channels[channel as usize & 0x0F].bend = value as f32 / 8192.0 * 2.0;
    }

    fn render(&mut self, out: &mut Vec<i16>, frames: usize) {
        let rate = self.sample_rate as f32;
        out.reserve(frames * 2);

        for _ in 0..frames {
            let mut left = 0.0f32;
            let mut right = 0.0f32;

            for voice in self.voices.iter_mut() {
                let channel = &self.channels[voice.channel as usize];

                if voice.channel == DRUM_CHANNEL {
                    voice.envelope *= self.drum_decay;
                } else if voice.released {
                    voice.envelope -= self.release_step;
                } else if voice.envelope < 1.0 {
                    voice.envelope = (voice.envelope + self.attack_step).min(1.0);
                }

                let s = voice.sample() * channel.volume * channel.expression;
                left += s * (1.0 - channel.pan).sqrt();
                right += s * channel.pan.sqrt();

                voice.phase += voice.frequency(channel.bend) / rate;
                voice.phase -= voice.phase.floor();
            }

            self.voices.retain(|v| v.envelope > 0.0005 || (!v.released && v.channel != DRUM_CHANNEL));

            let scale = self.gain * i16::MAX as f32;
            out.push((left * scale).clamp(i16::MIN as f32, i16::MAX as f32) as i16);
            out.push((right * scale).clamp(i16::MIN as f32, i16::MAX as f32) as i16);
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Creates synth instances for a [`SynthPool`]
pub type SynthFactory = Box<dyn Fn() -> Result<Box<dyn Synth>> + Send + Sync>;

struct PoolInner {
    idle: Vec<Box<dyn Synth>>,
    /// Instances created so far (idle + leased)
    created: usize,
}

/// Fixed-size pool of synth instances.
pub struct SynthPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
    factory: SynthFactory,
}

impl SynthPool {
    /// Pool of at most `capacity` synths created on demand by `factory`.
    pub fn new(capacity: usize, factory: SynthFactory) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                created: 0,
            }),
            capacity: capacity.max(1),
            factory,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Synths currently leased out
    pub fn leased(&self) -> usize {
        let inner = self.inner.lock();
        inner.created - inner.idle.len()
    }

    /// Take an idle synth, creating one if the pool is not yet full.
    pub fn acquire(self: &Arc<Self>) -> Result<SynthLease> {
        let mut inner = self.inner.lock();
        let synth = match inner.idle.pop() {
            Some(synth) => synth,
            None if inner.created < self.capacity => {
                let synth = (self.factory)()?;
                inner.created += 1;
                debug!("Created synth instance {}/{}", inner.created, self.capacity);
                synth
            }
            None => {
                return Err(Error::Midi(format!(
                    "All {} synth instances are in use",
                    self.capacity
                )));
            }
        };

        Ok(SynthLease {
            synth,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, mut synth: Box<dyn Synth>) {
        synth.reset();
        self.inner.lock().idle.push(synth);
    }
}

/// Placeholder left in a lease while its synth goes back to the pool
struct Detached;

impl Synth for Detached {
    fn reset(&mut self) {}
    fn note_on(&mut self, _: u8, _: u8, _: u8) {}
    fn note_off(&mut self, _: u8, _: u8) {}
    fn control_change(&mut self, _: u8, _: u8, _: u8) {}
    fn program_change(&mut self, _: u8, _: u8) {}
    fn pitch_bend(&mut self, _: u8, _: i16) {}
    fn render(&mut self, out: &mut Vec<i16>, frames: usize) {
        out.resize(out.len() + frames * 2, 0);
    }
    fn sample_rate(&self) -> u32 {
        1
    }
}

/// A synth borrowed from a [`SynthPool`]; returned on drop.
pub struct SynthLease {
    synth: Box<dyn Synth>,
    pool: Arc<SynthPool>,
}

impl Deref for SynthLease {
    type Target = dyn Synth;

    fn deref(&self) -> &Self::Target {
        self.synth.as_ref()
    }
}

impl DerefMut for SynthLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.synth.as_mut()
    }
}

impl Drop for SynthLease {
    fn drop(&mut self) {
        let synth = std::mem::replace(&mut self.synth, Box::new(Detached));
        self.pool.release(synth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_pool(capacity: usize) -> Arc<SynthPool> {
        SynthPool::new(
            capacity,
            Box::new(|| Ok(Box::new(ToneSynth::new(8000, 8, 0.5)) as Box<dyn Synth>)),
        )
    }

    #[test]
    fn test_silence_without_notes() {
        let mut synth = ToneSynth::new(8000, 4, 0.5);
        let mut out = Vec::new();
        synth.render(&mut out, 100);
        assert_eq!(out.len(), 200);
        assert!(out.iter().all(|s| *s == 0));
    }

    #[test]
    fn test_note_produces_sound_and_releases() {
        let mut synth = ToneSynth::new(8000, 4, 0.5);
        synth.note_on(0, 69, 127);
        let mut out = Vec::new();
        synth.render(&mut out, 800);
        assert!(out.iter().any(|s| s.unsigned_abs() > 1000));

        synth.note_off(0, 69);
        out.clear();
        synth.render(&mut out, 8000);
        assert_eq!(synth.active_voices(), 0);
    }

    #[test]
    fn test_voice_stealing_respects_polyphony() {
        let mut synth = ToneSynth::new(8000, 2, 0.5);
        synth.note_on(0, 60, 100);
        synth.note_on(0, 62, 100);
        synth.note_on(0, 64, 100);
        assert_eq!(synth.active_voices(), 2);
    }

    #[test]
    fn test_sustain_pedal_holds_notes() {
        let mut synth = ToneSynth::new(8000, 4, 0.5);
        synth.control_change(0, 64, 127);
        synth.note_on(0, 60, 100);
        synth.note_off(0, 60);
        let mut out = Vec::new();
        synth.render(&mut out, 4000);
        assert_eq!(synth.active_voices(), 1);

        synth.control_change(0, 64, 0);
        synth.render(&mut out, 4000);
        assert_eq!(synth.active_voices(), 0);
    }

    #[test]
    fn test_pan_hard_left() {
        let mut synth = ToneSynth::new(8000, 4, 0.5);
        synth.control_change(0, 10, 0);
        synth.note_on(0, 69, 127);
        let mut out = Vec::new();
        synth.render(&mut out, 400);
        assert!(out.chunks(2).all(|f| f[1] == 0));
        assert!(out.chunks(2).any(|f| f[0] != 0));
    }

    #[test]
    fn test_pool_leases_and_returns() {
        let pool = tone_pool(1);
        let lease = pool.acquire().unwrap();
        assert_eq!(pool.leased(), 1);
        assert!(pool.acquire().is_err());

        drop(lease);
        assert_eq!(pool.leased(), 0);
        let mut lease = pool.acquire().unwrap();
        assert_eq!(lease.sample_rate(), 8000);
        lease.note_on(0, 60, 100);
    }

    #[test]
    fn test_returned_synth_is_reset() {
        let pool = tone_pool(1);
        {
            let mut lease = pool.acquire().unwrap();
            lease.note_on(0, 60, 100);
        }
        let mut lease = pool.acquire().unwrap();
        let mut out = Vec::new();
        lease.render(&mut out, 10);
        assert!(out.iter().all(|s| *s == 0));
    }
}
