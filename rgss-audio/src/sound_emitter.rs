//! One-shot sound effects
//!
//! Sounds are decoded completely into a single device buffer and kept in a
//! byte-budgeted LRU cache keyed by path. A fixed pool of voices plays
//! them; when every voice is busy the least recently started one is
//! overtaken.
//!
//! A cache entry is pinned while a voice still holds it (its `Arc` has more
//! than one owner); eviction skips pinned entries, so the cache may stay
//! over budget until voices move on to other sounds.

use crate::config::AudioConfig;
use crate::decoder::{self, MidiState};
use crate::device::{AudioDevice, BufferId, SourceId, SourceState};
use rgss_common::FileSystem;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A decoded sound resident in one device buffer.
struct SoundBuffer {
    device: AudioDevice,
    buffer: BufferId,
    bytes: usize,
}

impl Drop for SoundBuffer {
    fn drop(&mut self) {
        self.device.delete_buffer(self.buffer);
    }
}

struct CacheEntry {
    sound: Arc<SoundBuffer>,
    /// Position in the recency order; larger is more recent
    stamp: u64,
}

/// Cache-backed voice pool for sound effects.
pub struct SoundEmitter {
    device: AudioDevice,
    fs: Arc<dyn FileSystem>,
    midi: Arc<MidiState>,
    global_volume: f32,

    entries: HashMap<String, CacheEntry>,
    recency: BTreeMap<u64, String>,
    next_stamp: u64,
    cached_bytes: usize,
    budget: usize,

    sources: Vec<SourceId>,
    attached: Vec<Option<Arc<SoundBuffer>>>,
    /// Voice indices, lowest priority first
    src_prio: Vec<usize>,
}

impl SoundEmitter {
    pub fn new(device: AudioDevice, fs: Arc<dyn FileSystem>, midi: Arc<MidiState>, config: &AudioConfig) -> Self {
        let count = config.se_source_count.max(1);
        let sources = (0..count).map(|_| device.gen_source()).collect();

        Self {
            device,
            fs,
            midi,
            global_volume: config.global_volume,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_stamp: 0,
            cached_bytes: 0,
            budget: config.se_cache_bytes,
            sources,
            attached: vec![None; count],
            src_prio: (0..count).collect(),
        }
    }

    /// Play `path` once at `volume`/`pitch` percent.
    ///
    /// Decode failures are logged and the call returns without sound.
    pub fn play(&mut self, path: &str, volume: i32, pitch: i32) {
        let volume = volume.clamp(0, 100) as f32 / 100.0;
        let pitch = pitch.clamp(50, 150) as f32 / 100.0;

        let Some(sound) = self.allocate(path) else {
            return;
        };

        let voice = self
            .sources
            .iter()
            .position(|&src| self.device.state(src) != SourceState::Playing)
            .unwrap_or(self.src_prio[0]);

        // The chosen voice becomes the last to be overtaken
        self.src_prio.retain(|&i| i != voice);
        self.src_prio.push(voice);

        let src = self.sources[voice];
        self.device.stop(src);

        let same = self.attached[voice]
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &sound));
        if !same {
            self.device.attach_buffer(src, sound.buffer);
            self.attached[voice] = Some(sound);
        }

        self.device.set_gain(src, volume * self.global_volume);
        self.device.set_pitch(src, pitch);
        self.device.play(src);
        trace!("SE {} on voice {}", path, voice);
    }

    /// Stop every voice.
    pub fn stop(&mut self) {
        for &src in &self.sources {
            self.device.stop(src);
        }
    }

    /// Bytes held by cached sounds
    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Cached paths, least recently used first
    pub fn cached_paths(&self) -> Vec<&str> {
        self.recency.values().map(String::as_str).collect()
    }

    /// Number of voices currently playing
    pub fn playing_voices(&self) -> usize {
        self.sources
            .iter()
            .filter(|&&src| self.device.state(src) == SourceState::Playing)
            .count()
    }

    fn allocate(&mut self, path: &str) -> Option<Arc<SoundBuffer>> {
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        if let Some(entry) = self.entries.get_mut(path) {
            let key = self.recency.remove(&entry.stamp).unwrap_or_else(|| path.to_string());
            entry.stamp = stamp;
            self.recency.insert(stamp, key);
            return Some(Arc::clone(&entry.sound));
        }

        let decoded = match decoder::decode_all(self.fs.as_ref(), path, &self.midi) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Failed to load sound effect {}: {}", path, e);
                return None;
            }
        };

        let buffer = self.device.gen_buffer();
        self.device
            .buffer_data(buffer, decoded.format(), &decoded.samples, decoded.sample_rate);
        let sound = Arc::new(SoundBuffer {
            device: self.device.clone(),
            buffer,
            bytes: decoded.byte_size(),
        });

        self.evict_for(sound.bytes);

        self.cached_bytes += sound.bytes;
        self.entries.insert(
            path.to_string(),
            CacheEntry {
                sound: Arc::clone(&sound),
                stamp,
            },
        );
        self.recency.insert(stamp, path.to_string());
        debug!("Cached SE {} ({} bytes, {} total)", path, sound.bytes, self.cached_bytes);

        Some(sound)
    }

    /// Drop least recently used, unpinned entries until `incoming` more
    /// bytes fit the budget (or nothing evictable is left).
    fn evict_for(&mut self, incoming: usize) {
        let mut stamps = self.recency.keys().copied().collect::<Vec<_>>().into_iter();

        while self.cached_bytes + incoming > self.budget {
            let Some(stamp) = stamps.next() else {
                break;
            };
            let Some(key) = self.recency.get(&stamp) else {
                continue;
            };
            let pinned = self
                .entries
                .get(key)
                .is_some_and(|entry| Arc::strong_count(&entry.sound) > 1);
            if pinned {
                continue;
            }

            if let Some(key) = self.recency.remove(&stamp) {
                if let Some(entry) = self.entries.remove(&key) {
                    self.cached_bytes -= entry.sound.bytes;
                    trace!("Evicted SE {} ({} bytes)", key, entry.sound.bytes);
                }
            }
        }
    }
}

impl Drop for SoundEmitter {
    fn drop(&mut self) {
        for &src in &self.sources {
            self.device.stop(src);
            self.device.delete_source(src);
        }
        self.attached.clear();
        self.entries.clear();
    }
}
