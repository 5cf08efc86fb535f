//! Sound-effect cache and voice pool through the facade

mod helpers;

use helpers::*;
use rgss_audio::AudioConfig;
use serial_test::serial;
use std::time::Duration;

#[test]
#[serial]
fn test_lru_by_play_order() {
    let game = TestGame::new();
    for name in ["A", "B", "C", "D"] {
        game.add_mono_wav(&format!("Audio/SE/{}.wav", name), 50);
    }
    let entry = mono_pcm_bytes(50);
    let audio = game.audio(AudioConfig {
        se_source_count: 1,
        se_cache_bytes: entry * 3,
        ..AudioConfig::default()
    });

    audio.se_play("Audio/SE/A", 100, 100);
    audio.se_play("Audio/SE/B", 100, 100);
    audio.se_play("Audio/SE/C", 100, 100);
    // Hit: A moves to the back of the eviction order
    audio.se_play("Audio/SE/A", 100, 100);
    audio.se_play("Audio/SE/D", 100, 100);

    audio.with_se(|se| {
        assert!(!se.is_cached("Audio/SE/B"));
        assert_eq!(se.cached_paths(), vec!["Audio/SE/C", "Audio/SE/A", "Audio/SE/D"]);
        assert_eq!(se.cached_bytes(), entry * 3);
    });
}

#[test]
#[serial]
fn test_budget_holds_once_voices_finish() {
    let game = TestGame::new();
    for i in 0..6 {
        game.add_mono_wav(&format!("Audio/SE/S{}.wav", i), 30);
    }
    let entry = mono_pcm_bytes(30);
    let audio = game.audio(AudioConfig {
        se_source_count: 2,
        se_cache_bytes: entry * 2,
        ..AudioConfig::default()
    });

    for i in 0..6 {
        audio.se_play(&format!("Audio/SE/S{}", i), 100, 100);
        assert!(wait_until(Duration::from_secs(1), || audio.with_se(|se| se.playing_voices() == 0)));
        audio.with_se(|se| {
            // Entries still attached to a voice may keep the cache over budget
            assert!(se.cached_bytes() <= se.budget() + 2 * entry);
        });
    }
    audio.with_se(|se| assert!(se.is_cached("Audio/SE/S5")));
}

#[test]
#[serial]
fn test_corrupt_effect_is_silent() {
    let game = TestGame::new();
    std::fs::write(game.path("Audio/SE/Bad.ogg"), b"OggS garbage that is not a stream").unwrap();
    let audio = game.audio(AudioConfig::default());

    audio.se_play("Audio/SE/Bad", 100, 100);
    audio.se_play("Audio/SE/Missing", 100, 100);
    audio.with_se(|se| {
        assert_eq!(se.playing_voices(), 0);
        assert_eq!(se.cached_bytes(), 0);
    });
}
