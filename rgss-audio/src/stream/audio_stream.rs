//! Volume-composited stream with fade threads
//!
//! Wraps a [`StreamEngine`] and its [`VolumeComposite`] behind one mutex
//! ([`StreamCore`]). Fade-out and fade-in each run on their own thread and
//! only take the core lock for the duration of one tick.
//!
//! Lock order: fade-in slot, then fade-out slot, then core. Fade threads
//! only ever take the core lock, and are joined with it released.

use super::engine::{LoopMode, StreamEngine, StreamState};
use super::volume::{VolumeComposite, VolumeKind};
use crate::config::FadeConfig;
use crate::decoder::MidiState;
use crate::device::AudioDevice;
use crate::error::Result;
use parking_lot::{Mutex, MutexGuard};
use rgss_common::{FadeCurve, FileSystem};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Tick of the fade threads
pub const FADE_TICK: Duration = Duration::from_millis(10);

/// Length of the automatic fade-in when playback starts from an offset
pub const FADE_IN_DURATION: Duration = Duration::from_secs(1);

/// Script volume range, in percent
const VOLUME_RANGE: (i32, i32) = (0, 100);

/// Script pitch range, in percent
const PITCH_RANGE: (i32, i32) = (50, 150);

/// Parameters of the most recent `play()`
#[derive(Debug, Clone, Default, PartialEq)]
struct Current {
    path: String,
    volume: f32,
    pitch: f32,
}

/// State guarded by the per-stream lock.
pub struct StreamCore {
    engine: StreamEngine,
    volume: VolumeComposite,
    current: Current,
    ext_paused: bool,
    no_resume_stop: bool,
}

impl StreamCore {
    /// Stream state after natural-end reconciliation
    pub fn state(&mut self) -> StreamState {
        self.engine.state()
    }

    pub fn play(&mut self, offset: f32) {
        self.engine.play(offset);
    }

    pub fn pause(&mut self) {
        self.engine.pause();
    }

    pub fn stop(&mut self) {
        self.engine.stop();
    }

    /// Set one multiplier and push the composite to the device.
    pub fn set_volume(&mut self, kind: VolumeKind, value: f32) {
        let gain = self.volume.set(kind, value);
        self.engine.set_volume(gain);
    }

    pub fn volume(&self, kind: VolumeKind) -> f32 {
        self.volume.get(kind)
    }

    /// Product of all multipliers and the global scale
    pub fn effective_volume(&self) -> f32 {
        self.volume.effective()
    }

    /// Playback position in seconds
    pub fn offset(&self) -> f32 {
        self.engine.query_offset()
    }

    /// Paused by the jingle choreographer
    pub fn ext_paused(&self) -> bool {
        self.ext_paused
    }

    pub fn set_ext_paused(&mut self, paused: bool) {
        self.ext_paused = paused;
    }

    /// Stopped by the script; the choreographer must not restart it
    pub fn no_resume_stop(&self) -> bool {
        self.no_resume_stop
    }

    /// Path given to the last successful `play()`
    pub fn current_path(&self) -> &str {
        &self.current.path
    }

    /// Whether the filler thread is running
    pub fn filler_alive(&self) -> bool {
        self.engine.filler_alive()
    }

    pub fn stream_inited(&self) -> bool {
        self.engine.stream_inited()
    }
}

/// Cancellation flags shared with one fade thread
#[derive(Debug, Default)]
struct FadeFlags {
    active: AtomicBool,
    /// Finish like normal (run completion side effects)
    req_fini: AtomicBool,
    /// Abandon immediately
    req_term: AtomicBool,
}

#[derive(Default)]
struct FadeSlot {
    flags: Arc<FadeFlags>,
    thread: Option<JoinHandle<()>>,
}

impl FadeSlot {
    /// Ask the running fade to finish normally and wait for it.
    fn finish(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.flags.req_fini.store(true, Ordering::SeqCst);
            if thread.join().is_err() {
                error!("Fade thread panicked");
            }
        }
    }

    /// Ask the running fade to exit without side effects and wait for it.
    fn terminate(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.flags.req_term.store(true, Ordering::SeqCst);
            if thread.join().is_err() {
                error!("Fade thread panicked");
            }
        }
    }

    fn is_active(&self) -> bool {
        self.flags.active.load(Ordering::SeqCst)
    }

    /// Fresh flags for a new thread, already marked active
    fn arm(&mut self) -> Arc<FadeFlags> {
        let flags = Arc::new(FadeFlags::default());
        flags.active.store(true, Ordering::SeqCst);
        self.flags = Arc::clone(&flags);
        flags
    }
}

/// A looped or one-shot music stream with fades.
pub struct AudioStream {
    name: &'static str,
    core: Arc<Mutex<StreamCore>>,
    fade_out: Mutex<FadeSlot>,
    fade_in: Mutex<FadeSlot>,
    fs: Arc<dyn FileSystem>,
    midi: Arc<MidiState>,
    curves: FadeConfig,
}

impl AudioStream {
    pub fn new(
        name: &'static str,
        device: AudioDevice,
        loop_mode: LoopMode,
        fs: Arc<dyn FileSystem>,
        midi: Arc<MidiState>,
        global_volume: f32,
        curves: FadeConfig,
    ) -> Self {
        let engine = StreamEngine::new(device, loop_mode);
        let volume = VolumeComposite::new(global_volume);
        engine.set_volume(volume.effective());

        Self {
            name,
            core: Arc::new(Mutex::new(StreamCore {
                engine,
                volume,
                current: Current {
                    path: String::new(),
                    volume: 1.0,
                    pitch: 1.0,
                },
                ext_paused: false,
                no_resume_stop: false,
            })),
            fade_out: Mutex::new(FadeSlot::default()),
            fade_in: Mutex::new(FadeSlot::default()),
            fs,
            midi,
            curves,
        }
    }

    /// Channel name used in diagnostics
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take the per-stream lock.
    pub fn lock(&self) -> MutexGuard<'_, StreamCore> {
        self.core.lock()
    }

    /// Play `path` at `volume`/`pitch` percent, starting `offset` seconds in.
    ///
    /// Opening errors surface here; the stream is left Closed.
    pub fn play(&self, path: &str, volume: i32, pitch: i32, offset: f32) -> Result<()> {
        let mut fade_in = self.fade_in.lock();
        fade_in.finish();
        self.fade_out.lock().finish();

        let volume = volume.clamp(VOLUME_RANGE.0, VOLUME_RANGE.1) as f32 / 100.0;
        let pitch = pitch.clamp(PITCH_RANGE.0, PITCH_RANGE.1) as f32 / 100.0;

        let mut core = self.core.lock();
        let state = core.state();
        let running = matches!(state, StreamState::Playing | StreamState::Paused);
        let same_path = core.current.path == path;

        if same_path && running && core.current.pitch == pitch {
            if core.current.volume != volume {
                core.set_volume(VolumeKind::Base, volume);
                core.current.volume = volume;
            }
            return Ok(());
        }

        if running {
            core.engine.stop();
        }

        if !same_path || core.engine.state() == StreamState::Closed {
            core.current.path.clear();
            core.engine.open(self.fs.as_ref(), path, &self.midi)?;
        }

        core.set_volume(VolumeKind::Base, volume);
        core.engine.set_pitch(pitch);

        if offset > 0.0 {
            core.set_volume(VolumeKind::FadeIn, 0.0);
            self.start_fade_in(&mut fade_in, &mut core);
        }

        core.current = Current {
            path: path.to_string(),
            volume,
            pitch,
        };

        if core.ext_paused {
            core.no_resume_stop = false;
        } else {
            core.engine.play(offset);
        }

        debug!("{}: playing {} (volume {}, pitch {})", self.name, path, volume, pitch);
        Ok(())
    }

    pub fn stop(&self) {
        self.finish_fades();

        let mut core = self.core.lock();
        core.no_resume_stop = true;
        core.engine.stop();
    }

    /// Fade to silence over `duration_ms`, then stop.
    ///
    /// A paused stream stops immediately. While a fade-out is already
    /// running the request is ignored; that fade ends in a stop anyway.
    pub fn fade_out(&self, duration_ms: u32) {
        let mut slot = self.fade_out.lock();
        if slot.is_active() {
            return;
        }
        slot.finish();

        let mut core = self.core.lock();
        core.no_resume_stop = true;

        match core.state() {
            StreamState::Paused => {
                core.engine.stop();
                return;
            }
            StreamState::Playing => {}
            StreamState::Closed | StreamState::Stopped => return,
        }

        if duration_ms == 0 {
            core.engine.stop();
            return;
        }

        let flags = slot.arm();
        let core_ref = Arc::clone(&self.core);
        let curve = self.curves.out_curve;
        let duration = Duration::from_millis(duration_ms as u64);
        drop(core);

        match thread::Builder::new()
            .name(format!("{}-fadeout", self.name))
            .spawn(move || fade_out_thread(&core_ref, &flags, curve, duration))
        {
            Ok(handle) => slot.thread = Some(handle),
            Err(e) => {
                error!("{}: failed to spawn fade-out thread: {}", self.name, e);
                slot.flags.active.store(false, Ordering::SeqCst);
                self.core.lock().engine.stop();
            }
        }
    }

    /// Whether a fade-out thread is still running
    pub fn fade_out_active(&self) -> bool {
        self.fade_out.lock().is_active()
    }

    pub fn fade_in_active(&self) -> bool {
        self.fade_in.lock().is_active()
    }

    /// Base volume in percent
    pub fn volume(&self) -> i32 {
        (self.core.lock().volume(VolumeKind::Base) * 100.0).round() as i32
    }

    /// Set the base volume in percent.
    pub fn set_volume(&self, volume: i32) {
        let value = volume.clamp(VOLUME_RANGE.0, VOLUME_RANGE.1) as f32 / 100.0;
        let mut core = self.core.lock();
        core.set_volume(VolumeKind::Base, value);
        core.current.volume = value;
    }

    pub fn set_volume_kind(&self, kind: VolumeKind, value: f32) {
        self.core.lock().set_volume(kind, value);
    }

    pub fn volume_kind(&self, kind: VolumeKind) -> f32 {
        self.core.lock().volume(kind)
    }

    /// Playback position in seconds
    pub fn offset(&self) -> f32 {
        self.core.lock().offset()
    }

    pub fn state(&self) -> StreamState {
        self.core.lock().state()
    }

    fn start_fade_in(&self, slot: &mut FadeSlot, core: &mut StreamCore) {
        let flags = slot.arm();
        let core_ref = Arc::clone(&self.core);
        let curve = self.curves.in_curve;

        match thread::Builder::new()
            .name(format!("{}-fadein", self.name))
            .spawn(move || fade_in_thread(&core_ref, &flags, curve))
        {
            Ok(handle) => slot.thread = Some(handle),
            Err(e) => {
                error!("{}: failed to spawn fade-in thread: {}", self.name, e);
                slot.flags.active.store(false, Ordering::SeqCst);
                core.set_volume(VolumeKind::FadeIn, 1.0);
            }
        }
    }

    fn finish_fades(&self) {
        self.fade_out.lock().finish();
        self.fade_in.lock().finish();
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.fade_out.lock().terminate();
        self.fade_in.lock().terminate();

        let mut core = self.core.lock();
        core.engine.stop();
        core.engine.close();
    }
}

fn fade_out_thread(core: &Mutex<StreamCore>, flags: &FadeFlags, curve: FadeCurve, duration: Duration) {
    let start = Instant::now();

    loop {
        if flags.req_term.load(Ordering::SeqCst) {
            break;
        }

        let mut core = core.lock();
        let position = start.elapsed().as_secs_f32() / duration.as_secs_f32();
        let state = core.state();

        if state != StreamState::Playing || position > 1.0 || flags.req_fini.load(Ordering::SeqCst) {
            if state != StreamState::Paused {
                core.engine.stop();
            }
            core.set_volume(VolumeKind::FadeOut, 1.0);
            break;
        }

        core.set_volume(VolumeKind::FadeOut, curve.calculate_fade_out(position));
        drop(core);
        thread::sleep(FADE_TICK);
    }

    flags.active.store(false, Ordering::SeqCst);
}

fn fade_in_thread(core: &Mutex<StreamCore>, flags: &FadeFlags, curve: FadeCurve) {
    let start = Instant::now();

    loop {
        if flags.req_term.load(Ordering::SeqCst) {
            break;
        }

        let mut core = core.lock();
        let progress = start.elapsed().as_secs_f32() / FADE_IN_DURATION.as_secs_f32();
        let state = core.state();

        if state != StreamState::Playing || progress >= 1.0 || flags.req_fini.load(Ordering::SeqCst) {
            core.set_volume(VolumeKind::FadeIn, 1.0);
            break;
        }

        core.set_volume(VolumeKind::FadeIn, curve.calculate_fade_in(progress));
        drop(core);
        thread::sleep(FADE_TICK);
    }

    flags.active.store(false, Ordering::SeqCst);
}
