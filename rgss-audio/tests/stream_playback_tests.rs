//! Stream engine behaviour through the public API
//!
//! All tests run against the headless output driver, which consumes audio
//! at wall-clock rate.

mod helpers;

use helpers::*;
use rgss_audio::{AudioConfig, Error, StreamState};
use serial_test::serial;
use std::thread;
use std::time::Duration;

fn config() -> AudioConfig {
    AudioConfig {
        global_volume: 1.0,
        ..AudioConfig::default()
    }
}

#[test]
#[serial]
fn test_identical_play_does_not_restart() {
    let game = TestGame::new();
    game.add_wav("Audio/BGM/Field.wav", 5000);
    let audio = game.audio(config());

    audio.bgm_play("Audio/BGM/Field", 100, 100, 0.0, 0).unwrap();
    thread::sleep(Duration::from_millis(400));
    let before = audio.bgm_pos(0).unwrap();
    assert!(before > 0.2, "position {}", before);

    audio.bgm_play("Audio/BGM/Field", 100, 100, 0.0, 0).unwrap();
    let after = audio.bgm_pos(0).unwrap();
    assert!(after >= before, "position went back from {} to {}", before, after);

    thread::sleep(Duration::from_millis(200));
    assert!(audio.bgm_pos(0).unwrap() > after);
}

#[test]
#[serial]
fn test_pause_then_play_resumes_in_place() {
    let game = TestGame::new();
    game.add_wav("Audio/BGM/Field.wav", 5000);
    let audio = game.audio(config());
    audio.bgm_play("Audio/BGM/Field", 100, 100, 0.0, 0).unwrap();
    thread::sleep(Duration::from_millis(500));

    let stream = audio.bgm_stream(0).unwrap();
    stream.lock().pause();
    let paused_at = stream.offset();
    thread::sleep(Duration::from_millis(300));
    assert!((stream.offset() - paused_at).abs() < 0.01);

    stream.lock().play(0.0);
    assert_eq!(stream.state(), StreamState::Playing);
    let resumed_at = stream.offset();
    assert!(
        (resumed_at - paused_at).abs() < 0.05,
        "paused at {}, resumed at {}",
        paused_at,
        resumed_at
    );
}

#[test]
#[serial]
fn test_volume_change_keeps_position() {
    let game = TestGame::new();
    game.add_wav("Audio/BGM/Field.wav", 5000);
    let audio = game.audio(config());

    audio.bgm_play("Audio/BGM/Field", 100, 100, 0.0, 0).unwrap();
    thread::sleep(Duration::from_millis(300));
    let before = audio.bgm_pos(0).unwrap();

    audio.bgm_play("Audio/BGM/Field", 50, 100, 0.0, 0).unwrap();
    assert!(audio.bgm_pos(0).unwrap() >= before);
    assert_eq!(audio.bgm_volume(0).unwrap(), 50);
}

#[test]
#[serial]
fn test_empty_and_truncated_files_fail_to_open() {
    let game = TestGame::new();
    std::fs::write(game.path("Audio/BGM/Empty.ogg"), b"").unwrap();
    generate_truncated_wav(game.path("Audio/BGM/Cut.wav"), 20).unwrap();
    let audio = game.audio(config());

    for name in ["Audio/BGM/Empty", "Audio/BGM/Cut"] {
        let result = audio.bgm_play(name, 100, 100, 0.0, 0);
        assert!(result.is_err(), "{} opened", name);
        let stream = audio.bgm_stream(0).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!stream.lock().filler_alive());
    }

    assert!(matches!(
        audio.bgm_play("Audio/BGM/Missing", 100, 100, 0.0, 0),
        Err(Error::NotFound(_))
    ));
}

#[test]
#[serial]
fn test_non_looped_stream_stops_at_end() {
    let game = TestGame::new();
    game.add_wav("Audio/ME/Victory.wav", 300);
    let audio = game.audio(config());

    audio.me_play("Audio/ME/Victory", 100, 100).unwrap();
    let me = audio.me_stream();
    assert!(wait_until(Duration::from_secs(2), || me.state() == StreamState::Stopped));
    assert!(!me.lock().filler_alive());
}

#[test]
#[serial]
fn test_looped_stream_wraps() {
    let game = TestGame::new();
    game.add_wav("Audio/BGS/Rain.wav", 400);
    let audio = game.audio(config());

    audio.bgs_play("Audio/BGS/Rain", 100, 100, 0.0).unwrap();
    thread::sleep(Duration::from_millis(1000));

    assert_eq!(audio.bgs_stream().state(), StreamState::Playing);
    let pos = audio.bgs_pos();
    assert!(pos < 0.45, "position {} past the loop end", pos);
}

#[test]
#[serial]
fn test_playing_implies_live_initialized_filler() {
    let game = TestGame::new();
    game.add_wav("Audio/BGM/Field.wav", 2000);
    let audio = game.audio(config());
    audio.bgm_play("Audio/BGM/Field", 100, 100, 0.0, 0).unwrap();

    let stream = audio.bgm_stream(0).unwrap();
    assert!(wait_until(Duration::from_secs(1), || stream.lock().stream_inited()));
    for _ in 0..20 {
        let mut core = stream.lock();
        match core.state() {
            StreamState::Playing => assert!(core.filler_alive() && core.stream_inited()),
            _ => assert!(!core.filler_alive()),
        }
        drop(core);
        thread::sleep(Duration::from_millis(20));
    }

    audio.bgm_stop(0).unwrap();
    assert!(!stream.lock().filler_alive());
}

#[test]
#[serial]
fn test_start_offset_and_midi_bgm() {
    let game = TestGame::new();
    generate_midi(game.path("Audio/BGM/Theme.mid"), &[60, 64, 67, 72], 960).unwrap();
    let audio = game.audio(config());

    audio.setup_midi().unwrap();
    audio.bgm_play("Audio/BGM/Theme", 100, 100, 1.0, 0).unwrap();
    thread::sleep(Duration::from_millis(100));

    let pos = audio.bgm_pos(0).unwrap();
    assert!(pos >= 1.0, "position {}", pos);
    assert_eq!(audio.bgm_stream(0).unwrap().state(), StreamState::Playing);
}
