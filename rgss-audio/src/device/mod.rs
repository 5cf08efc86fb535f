//! Hardware buffer-queue abstraction
//!
//! A software audio device with OpenAL-style sources and buffers:
//! - Buffers hold one chunk of 16-bit PCM plus format metadata
//! - Sources play a queue of buffers, marking each one processed once the
//!   playhead has moved past it
//! - A source that runs out of queued data stops on its own (underrun)
//!
//! Buffers and sources live in slab arenas behind a single mutex. The
//! [`output`] drivers pull mixed frames out through [`AudioDevice::render`].

pub mod output;
pub mod ring_buffer;
pub mod types;

pub use output::{OutputDriver, OutputMode};
pub use types::{AudioFrame, BufferFormat};

use parking_lot::Mutex;
use slab::Slab;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{trace, warn};

/// Highest playback-rate multiplier a source accepts
const MAX_PITCH: f32 = 4.0;

/// Lowest playback-rate multiplier a source accepts
const MIN_PITCH: f32 = 0.01;

/// Handle to a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

/// Handle to a device source (mixing voice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

/// Playback state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Never played since creation or since its queue was replaced
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// Metadata of an uploaded buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    /// Bits per sample (0 for an empty buffer)
    pub bits: u16,

    /// Channel count (0 for an empty buffer)
    pub channels: u16,

    /// Size of the PCM payload in bytes
    pub size: usize,

    /// Sample rate of the payload
    pub frequency: u32,
}

impl BufferInfo {
    /// Frames contained in the buffer, computed from its byte size
    pub fn frames(&self) -> u64 {
        if self.bits == 0 || self.channels == 0 {
            return 0;
        }
        (self.size / (self.bits as usize / 8) / self.channels as usize) as u64
    }
}

struct BufferSlot {
    format: BufferFormat,
    frequency: u32,
    samples: Vec<i16>,
}

impl BufferSlot {
    fn frames(&self) -> usize {
        self.samples.len() / self.format.channels() as usize
    }

    fn is_empty(&self) -> bool {
        self.samples.is_empty() || self.frequency == 0
    }

    /// Linear-interpolated stereo sample at fractional frame `pos`
    fn sample_at(&self, pos: f64) -> (f32, f32) {
        let frames = self.frames();
        let index = (pos.floor() as usize).min(frames - 1);
        let next = (index + 1).min(frames - 1);
        let frac = (pos - index as f64) as f32;

        let read = |frame: usize| -> (f32, f32) {
            match self.format {
                BufferFormat::Mono16 => {
                    let s = self.samples[frame] as f32 / 32768.0;
                    (s, s)
                }
                BufferFormat::Stereo16 => (
                    self.samples[frame * 2] as f32 / 32768.0,
                    self.samples[frame * 2 + 1] as f32 / 32768.0,
                ),
            }
        };

        let (l0, r0) = read(index);
        let (l1, r1) = read(next);
        (l0 + (l1 - l0) * frac, r0 + (r1 - r0) * frac)
    }
}

struct SourceSlot {
    queue: VecDeque<BufferId>,
    /// Leading queue entries that have been played completely
    processed: usize,
    /// Fractional frame position inside `queue[processed]`
    cursor: f64,
    state: SourceState,
    gain: f32,
    pitch: f32,
}

impl SourceSlot {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            processed: 0,
            cursor: 0.0,
            state: SourceState::Initial,
            gain: 1.0,
            pitch: 1.0,
        }
    }

    fn rewind(&mut self) {
        self.processed = 0;
        self.cursor = 0.0;
    }

    fn finish(&mut self) {
        self.state = SourceState::Stopped;
        self.processed = self.queue.len();
        self.cursor = 0.0;
    }
}

struct Mixer {
    buffers: Slab<BufferSlot>,
    sources: Slab<SourceSlot>,
    output_rate: u32,
}

impl Mixer {
    fn mix_source(
        buffers: &Slab<BufferSlot>,
        src: &mut SourceSlot,
        output_rate: u32,
        out: &mut [f32],
    ) {
        let frames_out = out.len() / 2;
        let mut i = 0;

        while i < frames_out {
            let Some(&buf_id) = src.queue.get(src.processed) else {
                src.finish();
                return;
            };
            let Some(buf) = buffers.get(buf_id.0).filter(|b| !b.is_empty()) else {
                src.processed += 1;
                src.cursor = 0.0;
                continue;
            };

            let frames = buf.frames() as f64;
            let step = buf.frequency as f64 / output_rate as f64 * src.pitch as f64;

            while i < frames_out && src.cursor < frames {
                let (l, r) = buf.sample_at(src.cursor);
                out[i * 2] += l * src.gain;
                out[i * 2 + 1] += r * src.gain;
                src.cursor += step;
                i += 1;
            }

            if src.cursor >= frames {
                src.cursor -= frames;
                src.processed += 1;
            }
        }

        if src.processed >= src.queue.len() {
            src.finish();
        }
    }
}

/// Shared handle to the software audio device.
///
/// Cloning is cheap; all clones address the same buffers and sources.
#[derive(Clone)]
pub struct AudioDevice {
    mixer: Arc<Mutex<Mixer>>,
    output_rate: u32,
}

impl std::fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDevice")
            .field("output_rate", &self.output_rate)
            .finish()
    }
}

impl AudioDevice {
    /// Create a device mixing at `output_rate` Hz.
    pub fn new(output_rate: u32) -> Self {
        Self {
            mixer: Arc::new(Mutex::new(Mixer {
                buffers: Slab::new(),
                sources: Slab::new(),
                output_rate: output_rate.max(1),
            })),
            output_rate: output_rate.max(1),
        }
    }

    /// Mixing rate in Hz
    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    // ---------------------------------------------------------------
    // Buffers
    // ---------------------------------------------------------------

    /// Allocate an empty buffer.
    pub fn gen_buffer(&self) -> BufferId {
        let mut mixer = self.mixer.lock();
        BufferId(mixer.buffers.insert(BufferSlot {
            format: BufferFormat::Stereo16,
            frequency: 0,
            samples: Vec::new(),
        }))
    }

    /// Release a buffer, dropping it from any source queue still holding it.
    pub fn delete_buffer(&self, id: BufferId) {
        let mut mixer = self.mixer.lock();
        if mixer.buffers.try_remove(id.0).is_none() {
            warn!("delete_buffer: unknown buffer {:?}", id);
            return;
        }
        for (_, src) in mixer.sources.iter_mut() {
            if let Some(pos) = src.queue.iter().position(|b| *b == id) {
                warn!("Deleting buffer {:?} still queued on a source", id);
                src.queue.remove(pos);
                if pos < src.processed {
                    src.processed -= 1;
                } else if pos == src.processed {
                    src.cursor = 0.0;
                }
            }
        }
    }

    /// Upload PCM data into a buffer, replacing its previous contents.
    pub fn buffer_data(&self, id: BufferId, format: BufferFormat, samples: &[i16], frequency: u32) {
        let mut mixer = self.mixer.lock();
        match mixer.buffers.get_mut(id.0) {
            Some(slot) => {
                slot.format = format;
                slot.frequency = frequency;
                slot.samples.clear();
                slot.samples.extend_from_slice(samples);
            }
            None => warn!("buffer_data: unknown buffer {:?}", id),
        }
    }

    /// Query format metadata of a buffer.
    pub fn buffer_info(&self, id: BufferId) -> BufferInfo {
        let mixer = self.mixer.lock();
        match mixer.buffers.get(id.0) {
            Some(slot) if !slot.samples.is_empty() => BufferInfo {
                bits: slot.format.bits(),
                channels: slot.format.channels(),
                size: slot.samples.len() * std::mem::size_of::<i16>(),
                frequency: slot.frequency,
            },
            _ => BufferInfo::default(),
        }
    }

    // ---------------------------------------------------------------
    // Sources
    // ---------------------------------------------------------------

    /// Allocate a source in the Initial state.
    pub fn gen_source(&self) -> SourceId {
        SourceId(self.mixer.lock().sources.insert(SourceSlot::new()))
    }

    /// Release a source. Buffers it referenced stay allocated.
    pub fn delete_source(&self, id: SourceId) {
        if self.mixer.lock().sources.try_remove(id.0).is_none() {
            warn!("delete_source: unknown source {:?}", id);
        }
    }

    fn with_source<R>(&self, id: SourceId, default: R, f: impl FnOnce(&mut SourceSlot) -> R) -> R {
        let mut mixer = self.mixer.lock();
        match mixer.sources.get_mut(id.0) {
            Some(src) => f(src),
            None => {
                warn!("Unknown source {:?}", id);
                default
            }
        }
    }

    /// Append a buffer to the source's queue.
    pub fn queue_buffer(&self, src: SourceId, buf: BufferId) {
        self.with_source(src, (), |s| s.queue.push_back(buf));
    }

    /// Remove the oldest processed buffer from the queue.
    ///
    /// Returns `None` when no buffer has been processed yet.
    pub fn unqueue_buffer(&self, src: SourceId) -> Option<BufferId> {
        self.with_source(src, None, |s| {
            if s.processed == 0 {
                return None;
            }
            s.processed -= 1;
            s.queue.pop_front()
        })
    }

    /// Drop every queued buffer.
    pub fn clear_queue(&self, src: SourceId) {
        self.with_source(src, (), |s| {
            s.queue.clear();
            s.rewind();
            if s.state != SourceState::Initial {
                s.state = SourceState::Stopped;
            }
        });
    }

    /// Replace the queue with a single static buffer.
    pub fn attach_buffer(&self, src: SourceId, buf: BufferId) {
        self.with_source(src, (), |s| {
            s.queue.clear();
            s.queue.push_back(buf);
            s.rewind();
            s.state = SourceState::Initial;
        });
    }

    /// Number of queued buffers played completely.
    pub fn buffers_processed(&self, src: SourceId) -> usize {
        self.with_source(src, 0, |s| s.processed)
    }

    /// Number of buffers in the queue (processed or not).
    pub fn buffers_queued(&self, src: SourceId) -> usize {
        self.with_source(src, 0, |s| s.queue.len())
    }

    /// Current playback state.
    pub fn state(&self, src: SourceId) -> SourceState {
        self.with_source(src, SourceState::Stopped, |s| s.state)
    }

    /// Start playback; a paused source resumes, anything else restarts at
    /// the head of its queue.
    pub fn play(&self, src: SourceId) {
        self.with_source(src, (), |s| {
            if s.state != SourceState::Paused {
                s.rewind();
            }
            s.state = SourceState::Playing;
            trace!("Source playing ({} buffers queued)", s.queue.len());
        });
    }

    /// Pause a playing source.
    pub fn pause(&self, src: SourceId) {
        self.with_source(src, (), |s| {
            if s.state == SourceState::Playing {
                s.state = SourceState::Paused;
            }
        });
    }

    /// Stop a source, marking every queued buffer processed.
    pub fn stop(&self, src: SourceId) {
        self.with_source(src, (), |s| s.finish());
    }

    /// Set the source gain (linear, non-negative).
    pub fn set_gain(&self, src: SourceId, gain: f32) {
        self.with_source(src, (), |s| s.gain = gain.max(0.0));
    }

    /// Current source gain.
    pub fn gain(&self, src: SourceId) -> f32 {
        self.with_source(src, 0.0, |s| s.gain)
    }

    /// Set the playback-rate multiplier used to emulate pitch.
    pub fn set_pitch(&self, src: SourceId, pitch: f32) {
        self.with_source(src, (), |s| s.pitch = pitch.clamp(MIN_PITCH, MAX_PITCH));
    }

    /// Current playback-rate multiplier.
    pub fn pitch(&self, src: SourceId) -> f32 {
        self.with_source(src, 1.0, |s| s.pitch)
    }

    /// Playback position in seconds, measured from the first buffer still
    /// in the queue. Zero unless the source is playing or paused.
    pub fn sec_offset(&self, src: SourceId) -> f32 {
        let mixer = self.mixer.lock();
        let Some(s) = mixer.sources.get(src.0) else {
            return 0.0;
        };
        if !matches!(s.state, SourceState::Playing | SourceState::Paused) {
            return 0.0;
        }

        let seconds_of = |id: &BufferId, frames: f64| -> f64 {
            match mixer.buffers.get(id.0) {
                Some(b) if b.frequency > 0 => frames / b.frequency as f64,
                _ => 0.0,
            }
        };

        let mut offset: f64 = s
            .queue
            .iter()
            .take(s.processed)
            .map(|id| {
                let frames = mixer.buffers.get(id.0).map_or(0, |b| b.frames()) as f64;
                seconds_of(id, frames)
            })
            .sum();
        if let Some(current) = s.queue.get(s.processed) {
            offset += seconds_of(current, s.cursor);
        }
        offset as f32
    }

    // ---------------------------------------------------------------
    // Mixing
    // ---------------------------------------------------------------

    /// Mix every playing source into `out` (interleaved stereo).
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut mixer = self.mixer.lock();
        let Mixer {
            buffers,
            sources,
            output_rate,
        } = &mut *mixer;

        for (_, src) in sources.iter_mut() {
            if src.state == SourceState::Playing {
                Mixer::mix_source(buffers, src, *output_rate, out);
            }
        }
    }
}
