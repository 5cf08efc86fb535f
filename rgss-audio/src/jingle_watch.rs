//! Jingle choreographer
//!
//! Ducks every BGM track while the ME (jingle) stream plays and restores
//! them afterwards. One background thread calls [`JingleWatch::tick`] every
//! 10 ms; each tick locks all BGM tracks first, then the ME stream, and
//! releases everything before sleeping.
//!
//! ```text
//! MeNotPlaying --ME starts--> BgmFadingOut --all ducked--> MePlaying
//!      ^                         |   ^                        |
//!      |                ME ended |   | ME restarted    ME ended
//!      |                         v   |                        v
//!      +-------- faded in ---- BgmFadingIn <------------------+
//! ```

use crate::error::{Error, Result};
use crate::stream::{AudioStream, StreamCore, StreamState, VolumeKind};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Choreographer tick
pub const WATCH_TICK: Duration = Duration::from_millis(10);

/// External multiplier change per tick while ducking (200 ms total)
pub const FADE_OUT_STEP: f32 = 1.0 / 20.0;

/// External multiplier change per tick while restoring (1000 ms total)
pub const FADE_IN_STEP: f32 = 1.0 / 100.0;

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeWatchState {
    MeNotPlaying,
    BgmFadingOut,
    MePlaying,
    BgmFadingIn,
}

/// State machine coordinating the BGM tracks with the ME stream.
pub struct JingleWatch {
    bgm: Vec<Arc<AudioStream>>,
    me: Arc<AudioStream>,
    state: MeWatchState,
}

impl JingleWatch {
    pub fn new(bgm: Vec<Arc<AudioStream>>, me: Arc<AudioStream>) -> Self {
        Self {
            bgm,
            me,
            state: MeWatchState::MeNotPlaying,
        }
    }

    pub fn state(&self) -> MeWatchState {
        self.state
    }

    /// Advance the state machine by one step.
    pub fn tick(&mut self) {
        let mut bgm: Vec<_> = self.bgm.iter().map(|track| track.lock()).collect();
        let mut me = self.me.lock();
        let me_playing = me.state() == StreamState::Playing;

        let next = match self.state {
            MeWatchState::MeNotPlaying => {
                if me_playing {
                    for track in bgm.iter_mut() {
                        track.set_ext_paused(true);
                    }
                    MeWatchState::BgmFadingOut
                } else {
                    MeWatchState::MeNotPlaying
                }
            }

            MeWatchState::BgmFadingOut => {
                if !me_playing {
                    // Short jingle: some tracks may still be mid-duck
                    release_tracks(&mut bgm);
                    MeWatchState::BgmFadingIn
                } else {
                    let mut all_ducked = true;
                    for track in bgm.iter_mut() {
                        let volume = track.volume(VolumeKind::External) - FADE_OUT_STEP;
                        if volume <= f32::EPSILON || track.state() != StreamState::Playing {
                            track.set_volume(VolumeKind::External, 0.0);
                            track.pause();
                        } else {
                            track.set_volume(VolumeKind::External, volume);
                            all_ducked = false;
                        }
                    }
                    if all_ducked {
                        MeWatchState::MePlaying
                    } else {
                        MeWatchState::BgmFadingOut
                    }
                }
            }

            MeWatchState::MePlaying => {
                if me_playing {
                    MeWatchState::MePlaying
                } else if release_tracks(&mut bgm) {
                    MeWatchState::BgmFadingIn
                } else {
                    MeWatchState::MeNotPlaying
                }
            }

            MeWatchState::BgmFadingIn => {
                let mut all_stopped = true;
                for track in bgm.iter_mut() {
                    if matches!(track.state(), StreamState::Stopped | StreamState::Closed) {
                        track.set_volume(VolumeKind::External, 1.0);
                    } else {
                        all_stopped = false;
                    }
                }

                if all_stopped {
                    MeWatchState::MeNotPlaying
                } else if me_playing {
                    for track in bgm.iter_mut() {
                        track.set_ext_paused(true);
                    }
                    MeWatchState::BgmFadingOut
                } else {
                    let mut all_restored = true;
                    for track in bgm.iter_mut() {
                        let volume = (track.volume(VolumeKind::External) + FADE_IN_STEP).min(1.0);
                        track.set_volume(VolumeKind::External, volume);
                        if volume < 1.0 {
                            all_restored = false;
                        }
                    }
                    if all_restored {
                        MeWatchState::MeNotPlaying
                    } else {
                        MeWatchState::BgmFadingIn
                    }
                }
            }
        };

        if next != self.state {
            debug!("Jingle watch: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Lift the external pause from every track: resume ducked tracks and start
/// the ones the script requested meanwhile. Returns whether any track still
/// has to be faded back in.
fn release_tracks(bgm: &mut [MutexGuard<'_, StreamCore>]) -> bool {
    let mut fading = false;
    for track in bgm.iter_mut() {
        track.set_ext_paused(false);
        match track.state() {
            StreamState::Paused => {
                track.play(0.0);
                fading = true;
            }
            StreamState::Playing => fading = true,
            StreamState::Stopped | StreamState::Closed => {
                // Stopped by the script while the ME played
                track.set_volume(VolumeKind::External, 1.0);
                if !track.no_resume_stop() {
                    track.play(0.0);
                }
            }
        }
    }
    fading
}

/// Background thread driving a [`JingleWatch`].
pub struct JingleWatchThread {
    watch: Arc<Mutex<JingleWatch>>,
    term_requested: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl JingleWatchThread {
    pub fn spawn(watch: JingleWatch) -> Result<Self> {
        let watch = Arc::new(Mutex::new(watch));
        let term_requested = Arc::new(AtomicBool::new(false));

        let thread = {
            let watch = Arc::clone(&watch);
            let term = Arc::clone(&term_requested);
            thread::Builder::new()
                .name("jingle-watch".to_string())
                .spawn(move || {
                    while !term.load(Ordering::SeqCst) {
                        watch.lock().tick();
                        thread::sleep(WATCH_TICK);
                    }
                })
                .map_err(|e| Error::AudioOutput(format!("Failed to spawn jingle watch: {}", e)))?
        };

        Ok(Self {
            watch,
            term_requested,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> MeWatchState {
        self.watch.lock().state()
    }
}

impl Drop for JingleWatchThread {
    fn drop(&mut self) {
        self.term_requested.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Jingle watch thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FadeConfig, MidiConfig};
    use crate::decoder::MidiState;
    use crate::device::AudioDevice;
    use crate::stream::LoopMode;
    use crate::test_util::{write_wav, MemoryFileSystem};

    const RATE: u32 = 8_000;

    struct Fixture {
        bgm: Vec<Arc<AudioStream>>,
        me: Arc<AudioStream>,
        watch: JingleWatch,
    }

    fn fixture(tracks: usize) -> Fixture {
        let device = AudioDevice::new(RATE);
        let mut fs = MemoryFileSystem::default();
        fs.insert("Song", write_wav(RATE, 2, RATE * 10));
        fs.insert("Fanfare", write_wav(RATE, 2, RATE * 2));
        let fs: Arc<dyn rgss_common::FileSystem> = Arc::new(fs);
        let midi = Arc::new(MidiState::new(MidiConfig::default(), 1));

        let stream = |name, mode| {
            Arc::new(AudioStream::new(
                name,
                device.clone(),
                mode,
                Arc::clone(&fs),
                Arc::clone(&midi),
                1.0,
                FadeConfig::default(),
            ))
        };

        let bgm: Vec<_> = (0..tracks).map(|_| stream("bgm", LoopMode::Looped)).collect();
        let me = stream("me", LoopMode::NotLooped);
        let watch = JingleWatch::new(bgm.clone(), Arc::clone(&me));
        Fixture { bgm, me, watch }
    }

    fn tick_until(watch: &mut JingleWatch, target: MeWatchState, max_ticks: usize) -> usize {
        for n in 1..=max_ticks {
            watch.tick();
            if watch.state() == target {
                return n;
            }
        }
        panic!("state {:?} not reached, stuck in {:?}", target, watch.state());
    }

    #[test]
    fn test_idle_without_jingle() {
        let mut f = fixture(1);
        f.bgm[0].play("Song", 100, 100, 0.0).unwrap();
        for _ in 0..10 {
            f.watch.tick();
        }
        assert_eq!(f.watch.state(), MeWatchState::MeNotPlaying);
        assert_eq!(f.bgm[0].volume_kind(VolumeKind::External), 1.0);
    }

    #[test]
    fn test_ducks_and_restores_all_tracks() {
        let mut f = fixture(2);
        for track in &f.bgm {
            track.play("Song", 100, 100, 0.0).unwrap();
        }
        f.me.play("Fanfare", 100, 100, 0.0).unwrap();

        let ticks = tick_until(&mut f.watch, MeWatchState::MePlaying, 25);
        assert!(ticks <= 25);
        for track in &f.bgm {
            assert_eq!(track.volume_kind(VolumeKind::External), 0.0);
            assert_eq!(track.state(), StreamState::Paused);
            assert!(track.lock().ext_paused());
        }

        f.me.stop();
        tick_until(&mut f.watch, MeWatchState::MeNotPlaying, 110);
        for track in &f.bgm {
            assert_eq!(track.volume_kind(VolumeKind::External), 1.0);
            assert_eq!(track.state(), StreamState::Playing);
            assert!(!track.lock().ext_paused());
        }
    }

    #[test]
    fn test_script_stop_during_jingle_is_honoured() {
        let mut f = fixture(1);
        f.bgm[0].play("Song", 100, 100, 0.0).unwrap();
        f.me.play("Fanfare", 100, 100, 0.0).unwrap();
        tick_until(&mut f.watch, MeWatchState::MePlaying, 25);

        f.bgm[0].stop();
        f.me.stop();
        f.watch.tick();

        assert_eq!(f.watch.state(), MeWatchState::MeNotPlaying);
        assert_eq!(f.bgm[0].state(), StreamState::Stopped);
        assert_eq!(f.bgm[0].volume_kind(VolumeKind::External), 1.0);
    }

    #[test]
    fn test_bgm_started_during_jingle_starts_afterwards() {
        let mut f = fixture(1);
        f.me.play("Fanfare", 100, 100, 0.0).unwrap();
        tick_until(&mut f.watch, MeWatchState::MePlaying, 25);

        // Deferred by the external pause
        f.bgm[0].play("Song", 100, 100, 0.0).unwrap();
        assert_eq!(f.bgm[0].state(), StreamState::Stopped);

        f.me.stop();
        f.watch.tick();
        assert_eq!(f.watch.state(), MeWatchState::MeNotPlaying);
        assert_eq!(f.bgm[0].state(), StreamState::Playing);
    }

    #[test]
    fn test_short_jingle_releases_tracks() {
        let mut f = fixture(2);
        for track in &f.bgm {
            track.play("Song", 100, 100, 0.0).unwrap();
        }
        f.me.play("Fanfare", 100, 100, 0.0).unwrap();
        f.watch.tick();
        f.watch.tick();
        assert_eq!(f.watch.state(), MeWatchState::BgmFadingOut);

        // Jingle ends before the music finished ducking
        f.me.stop();
        f.watch.tick();
        assert_eq!(f.watch.state(), MeWatchState::BgmFadingIn);
        tick_until(&mut f.watch, MeWatchState::MeNotPlaying, 110);

        for track in &f.bgm {
            assert!(!track.lock().ext_paused());
            assert_eq!(track.state(), StreamState::Playing);
            assert_eq!(track.volume_kind(VolumeKind::External), 1.0);
        }

        // A new song starts right away
        f.bgm[0].stop();
        f.bgm[0].play("Fanfare", 100, 100, 0.0).unwrap();
        assert_eq!(f.bgm[0].state(), StreamState::Playing);
    }

    #[test]
    fn test_jingle_restart_during_fade_in_ducks_again() {
        let mut f = fixture(1);
        f.bgm[0].play("Song", 100, 100, 0.0).unwrap();
        f.me.play("Fanfare", 100, 100, 0.0).unwrap();
        tick_until(&mut f.watch, MeWatchState::MePlaying, 25);

        f.me.stop();
        tick_until(&mut f.watch, MeWatchState::BgmFadingIn, 2);
        f.watch.tick();

        f.me.play("Fanfare", 100, 100, 0.0).unwrap();
        f.watch.tick();
        assert_eq!(f.watch.state(), MeWatchState::BgmFadingOut);
        assert!(f.bgm[0].lock().ext_paused());
    }

    #[test]
    fn test_thread_shuts_down_on_drop() {
        let f = fixture(1);
        let thread = JingleWatchThread::spawn(f.watch).unwrap();
        assert_eq!(thread.state(), MeWatchState::MeNotPlaying);
        drop(thread);
    }
}
