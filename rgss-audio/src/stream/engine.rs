//! Stream engine
//!
//! One hardware source fed from a ring of three device buffers by a
//! background filler thread. The foreground owns the [`StreamState`] enum;
//! the filler only raises atomic flags (`stream_inited`,
//! `source_exhausted`) that [`StreamEngine::check_stopped`] reconciles on
//! the next foreground call.
//!
//! The decoder moves into the filler thread while it runs and comes back
//! through the join handle, so foreground and background never share it.

use crate::decoder::{self, DataSource, FillStatus, MidiState};
use crate::device::{AudioDevice, BufferId, SourceId, SourceState};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rgss_common::FileSystem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Device buffers rotated per stream
pub const STREAM_BUFS: usize = 3;

/// Filler thread poll interval
pub const STREAM_SLEEP: Duration = Duration::from_millis(10);

/// Foreground-visible stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Stopped,
    Playing,
    Paused,
}

/// Whether a stream wraps at its end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Looped,
    NotLooped,
}

/// Flags shared with the filler thread
#[derive(Debug, Default)]
struct StreamShared {
    term_requested: AtomicBool,
    source_exhausted: AtomicBool,
    stream_inited: AtomicBool,
    needs_rewind: AtomicBool,
    /// Frames fully played from buffers already unqueued
    proc_frames: AtomicU64,
    /// Pause requested before the filler started the source
    preempt_pause: Mutex<bool>,
}

/// Everything the filler thread needs besides the decoder
#[derive(Clone)]
struct FillerContext {
    device: AudioDevice,
    source: SourceId,
    buffers: [BufferId; STREAM_BUFS],
    shared: Arc<StreamShared>,
    start_offset: f32,
}

/// Decode-and-play state machine for one logical stream.
pub struct StreamEngine {
    device: AudioDevice,
    source: SourceId,
    buffers: [BufferId; STREAM_BUFS],
    loop_mode: LoopMode,
    state: StreamState,
    data: Option<Box<dyn DataSource>>,
    thread: Option<JoinHandle<Box<dyn DataSource>>>,
    shared: Arc<StreamShared>,
    sample_rate: u32,
    start_offset: f32,
    pitch: f32,
}

impl StreamEngine {
    /// Allocate a source and its buffer ring on `device`.
    pub fn new(device: AudioDevice, loop_mode: LoopMode) -> Self {
        let source = device.gen_source();
        let buffers = [device.gen_buffer(), device.gen_buffer(), device.gen_buffer()];

        Self {
            device,
            source,
            buffers,
            loop_mode,
            state: StreamState::Closed,
            data: None,
            thread: None,
            shared: Arc::new(StreamShared::default()),
            sample_rate: 0,
            start_offset: 0.0,
            pitch: 1.0,
        }
    }

    /// Resolve and open `path`, replacing any current data source.
    ///
    /// On failure the stream is left Closed.
    pub fn open(&mut self, fs: &dyn FileSystem, path: &str, midi: &MidiState) -> Result<()> {
        self.close();
        let looped = self.loop_mode == LoopMode::Looped;
        let source = decoder::open_source(fs, path, looped, midi)?;
        self.open_source(source);
        debug!("Stream opened: {}", path);
        Ok(())
    }

    /// Take ownership of an already constructed data source.
    pub fn open_source(&mut self, source: Box<dyn DataSource>) {
        self.close();
        self.sample_rate = source.sample_rate().max(1);
        self.data = Some(source);
        self.shared.needs_rewind.store(false, Ordering::SeqCst);
        self.state = StreamState::Stopped;
    }

    /// Stop if needed and release the data source.
    pub fn close(&mut self) {
        self.check_stopped();

        match self.state {
            StreamState::Playing | StreamState::Paused => {
                self.stop_stream();
                self.close_source();
            }
            StreamState::Stopped => self.close_source(),
            StreamState::Closed => return,
        }
        self.state = StreamState::Closed;
    }

    /// Start (from `offset` seconds) or resume playback.
    pub fn play(&mut self, offset: f32) {
        if self.data.is_none() && self.thread.is_none() {
            return;
        }
        self.check_stopped();

        match self.state {
            StreamState::Closed | StreamState::Playing => return,
            StreamState::Stopped => {
                if let Err(e) = self.start_stream(offset) {
                    error!("Failed to start stream: {}", e);
                    return;
                }
            }
            StreamState::Paused => self.resume_stream(),
        }
        self.state = StreamState::Playing;
    }

    pub fn stop(&mut self) {
        self.check_stopped();

        match self.state {
            StreamState::Closed | StreamState::Stopped => return,
            StreamState::Playing | StreamState::Paused => self.stop_stream(),
        }
        self.state = StreamState::Stopped;
    }

    pub fn pause(&mut self) {
        self.check_stopped();

        match self.state {
            StreamState::Closed | StreamState::Stopped | StreamState::Paused => return,
            StreamState::Playing => self.pause_stream(),
        }
        self.state = StreamState::Paused;
    }

    /// Current state, after reconciling a natural end of playback
    pub fn state(&mut self) -> StreamState {
        self.check_stopped();
        self.state
    }

    /// Playback position in seconds
    pub fn query_offset(&self) -> f32 {
        if self.state == StreamState::Closed {
            return 0.0;
        }
        let proc_offset = self.shared.proc_frames.load(Ordering::SeqCst) as f64 / self.sample_rate as f64;
        proc_offset as f32 + self.device.sec_offset(self.source)
    }

    /// Set device gain directly (volume compositing happens a layer up)
    pub fn set_volume(&self, volume: f32) {
        self.device.set_gain(self.source, volume);
    }

    /// Pitch multiplier; applied natively by the decoder when it can,
    /// otherwise emulated through the source's playback rate.
    pub fn set_pitch(&mut self, value: f32) {
        self.pitch = value;
        let native = self.data.as_mut().is_some_and(|d| d.set_pitch(value));
        self.device.set_pitch(self.source, if native { 1.0 } else { value });
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Hardware source backing this stream
    pub fn source_id(&self) -> SourceId {
        self.source
    }

    /// Whether a filler thread exists and has not returned yet
    pub fn filler_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Whether the filler has queued its first buffer
    pub fn stream_inited(&self) -> bool {
        self.shared.stream_inited.load(Ordering::SeqCst)
    }

    /// Playing + filler done + hardware drained => Stopped
    fn check_stopped(&mut self) {
        if self.state != StreamState::Playing {
            return;
        }
        if !self.shared.stream_inited.load(Ordering::SeqCst) {
            return;
        }
        if !self.shared.source_exhausted.load(Ordering::SeqCst) {
            return;
        }
        if self.device.state(self.source) == SourceState::Playing {
            return;
        }

        trace!("Stream reached its end");
        self.stop_stream();
        self.state = StreamState::Stopped;
    }

    fn close_source(&mut self) {
        self.data = None;
    }

    fn start_stream(&mut self, offset: f32) -> Result<()> {
        let data = self
            .data
            .take()
            .ok_or_else(|| Error::Decode("Stream has no data source".to_string()))?;

        self.device.clear_queue(self.source);

        *self.shared.preempt_pause.lock() = false;
        self.shared.stream_inited.store(false, Ordering::SeqCst);
        self.shared.source_exhausted.store(false, Ordering::SeqCst);
        self.shared.term_requested.store(false, Ordering::SeqCst);

        self.start_offset = offset;
        self.shared
            .proc_frames
            .store((offset.max(0.0) as f64 * self.sample_rate as f64) as u64, Ordering::SeqCst);

        let ctx = FillerContext {
            device: self.device.clone(),
            source: self.source,
            buffers: self.buffers,
            shared: Arc::clone(&self.shared),
            start_offset: offset,
        };

        let handle = thread::Builder::new()
            .name("audio-stream".to_string())
            .spawn(move || {
                let mut data = data;
                stream_data(&ctx, data.as_mut());
                data
            })
            .map_err(|e| {
                self.state = StreamState::Closed;
                Error::AudioOutput(format!("Failed to spawn stream thread: {}", e))
            })?;

        self.thread = Some(handle);
        Ok(())
    }

    fn stop_stream(&mut self) {
        self.shared.term_requested.store(true, Ordering::SeqCst);

        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(data) => self.data = Some(data),
                Err(_) => {
                    error!("Stream thread panicked; closing stream");
                    self.state = StreamState::Closed;
                }
            }
            self.shared.needs_rewind.store(true, Ordering::SeqCst);
        }

        self.device.stop(self.source);
        self.shared.proc_frames.store(0, Ordering::SeqCst);
    }

    fn pause_stream(&self) {
        let mut preempt = self.shared.preempt_pause.lock();
        if self.device.state(self.source) != SourceState::Playing {
            *preempt = true;
        } else {
            self.device.pause(self.source);
        }
    }

    fn resume_stream(&self) {
        let mut preempt = self.shared.preempt_pause.lock();
        *preempt = false;
        // Before its first buffer the filler starts the source itself
        if !self.shared.stream_inited.load(Ordering::SeqCst) {
            return;
        }
        match self.device.state(self.source) {
            SourceState::Playing => {}
            // Drained while paused; the filler restarts it once refilled
            SourceState::Stopped if self.device.buffers_processed(self.source) > 0 => {}
            _ => self.device.play(self.source),
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.close();
        self.device.delete_source(self.source);
        for buf in self.buffers {
            self.device.delete_buffer(buf);
        }
    }
}

/// First start from the filler. A pause requested before the source could
/// start stays pending until the foreground resumes.
fn start_source(device: &AudioDevice, source: SourceId, shared: &StreamShared) {
    let preempt = shared.preempt_pause.lock();
    shared.stream_inited.store(true, Ordering::SeqCst);
    if !*preempt {
        device.play(source);
    }
}

/// Filler thread body
fn stream_data(ctx: &FillerContext, data: &mut dyn DataSource) {
    let shared = &ctx.shared;
    let device = &ctx.device;

    if shared.term_requested.load(Ordering::SeqCst) {
        return;
    }

    if shared.needs_rewind.swap(false, Ordering::SeqCst) || ctx.start_offset > 0.0 {
        data.seek_to_offset(ctx.start_offset);
    }

    // Buffers whose data ends exactly at a loop wrap
    let mut wrapped: Vec<BufferId> = Vec::with_capacity(STREAM_BUFS);
    let mut first_buffer = true;

    for &buf in &ctx.buffers {
        if shared.term_requested.load(Ordering::SeqCst) {
            return;
        }

        let status = data.fill_buffer(device, buf);
        if status == FillStatus::Error {
            warn!("Stream failed during initial fill; it will stop");
            shared.source_exhausted.store(true, Ordering::SeqCst);
            shared.stream_inited.store(true, Ordering::SeqCst);
            return;
        }

        device.queue_buffer(ctx.source, buf);
        if status == FillStatus::WrapAround {
            wrapped.push(buf);
        }

        if first_buffer {
            start_source(device, ctx.source, shared);
            first_buffer = false;
        }

        if shared.term_requested.load(Ordering::SeqCst) {
            return;
        }

        if status == FillStatus::EndOfStream {
            shared.source_exhausted.store(true, Ordering::SeqCst);
            break;
        }
    }

    // Wait for buffers to be consumed, then refill and queue them again
    loop {
        let mut requeued = false;
        let mut processed = device.buffers_processed(ctx.source);

        while processed > 0 {
            processed -= 1;
            if shared.term_requested.load(Ordering::SeqCst) {
                break;
            }

            // Nothing processed after all; try again next poll
            let Some(buf) = device.unqueue_buffer(ctx.source) else {
                break;
            };

            if let Some(i) = wrapped.iter().position(|&b| b == buf) {
                // The loop wrapped at the end of this buffer
                shared.proc_frames.store(data.loop_start_frames(), Ordering::SeqCst);
                wrapped.swap_remove(i);
            } else {
                let frames = device.buffer_info(buf).frames();
                shared.proc_frames.fetch_add(frames, Ordering::SeqCst);
            }

            if shared.source_exhausted.load(Ordering::SeqCst) {
                continue;
            }

            let status = data.fill_buffer(device, buf);
            if status == FillStatus::Error {
                warn!("Stream decode error; stopping at the end of queued audio");
                shared.source_exhausted.store(true, Ordering::SeqCst);
                return;
            }

            device.queue_buffer(ctx.source, buf);
            requeued = true;

            match status {
                FillStatus::WrapAround => wrapped.push(buf),
                FillStatus::EndOfStream => shared.source_exhausted.store(true, Ordering::SeqCst),
                _ => {}
            }
        }

        if shared.term_requested.load(Ordering::SeqCst) {
            break;
        }

        // Underrun: the source drained its queue before we refilled it
        if requeued {
            let preempt = shared.preempt_pause.lock();
            if !*preempt && device.state(ctx.source) == SourceState::Stopped {
                debug!("Stream underrun, restarting source");
                device.play(ctx.source);
            }
        }

        thread::sleep(STREAM_SLEEP);
    }
}
