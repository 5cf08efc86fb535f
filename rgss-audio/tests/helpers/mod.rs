//! Test helper modules for rgss-audio integration tests
//!
//! Provides reusable test infrastructure components:
//! - audio_generator: WAV/MIDI fixture files
//! - TestGame: a temporary game directory plus a headless [`Audio`]

#![allow(dead_code)]

pub mod audio_generator;

use rgss_audio::{Audio, AudioConfig};
use rgss_common::DirFileSystem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub use audio_generator::*;

/// Temporary game directory with the standard `Audio/*` layout
pub struct TestGame {
    dir: TempDir,
}

impl TestGame {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        for sub in ["Audio/BGM", "Audio/BGS", "Audio/ME", "Audio/SE"] {
            std::fs::create_dir_all(dir.path().join(sub)).expect("create audio dirs");
        }
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path for a relative asset file name
    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Add a sine WAV at `relative` (including extension).
    pub fn add_wav(&self, relative: &str, duration_ms: u64) {
        generate_sine_wav(self.path(relative), duration_ms, 440.0, 2).expect("write wav");
    }

    pub fn add_mono_wav(&self, relative: &str, duration_ms: u64) {
        generate_sine_wav(self.path(relative), duration_ms, 440.0, 1).expect("write wav");
    }

    pub fn filesystem(&self) -> Arc<DirFileSystem> {
        Arc::new(DirFileSystem::new(self.root()))
    }

    /// Headless audio engine over this directory
    pub fn audio(&self, config: AudioConfig) -> Audio {
        let mut config = config;
        config.output.headless = true;
        Audio::new(config, self.filesystem()).expect("create audio")
    }
}

/// Poll `condition` every 5 ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
