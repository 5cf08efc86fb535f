//! Audio Test File Generation Utilities
//!
//! Deterministic fixtures for the integration tests:
//! - Silent and sine-wave WAV files
//! - Minimal standard MIDI files
//! - Truncated files for open-failure tests

use hound::{WavSpec, WavWriter};
use std::f32::consts::PI;
use std::path::Path;

/// Standard test sample rate (44.1 kHz)
pub const TEST_SAMPLE_RATE: u32 = 44100;

/// Generate silent stereo WAV file
///
/// # Arguments
/// * `path` - Output file path
/// * `duration_ms` - Duration in milliseconds
pub fn generate_silent_wav<P: AsRef<Path>>(path: P, duration_ms: u64) -> Result<(), hound::Error> {
    let spec = WavSpec {
        channels: 2,
        sample_rate: TEST_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)?;

    let total_frames = (TEST_SAMPLE_RATE as u64 * duration_ms) / 1000;
    let total_samples = total_frames * 2; // stereo

    for _ in 0..total_samples {
        writer.write_sample(0i16)?;
    }

    writer.finalize()?;
    Ok(())
}

/// Generate sine wave WAV file
///
/// # Arguments
/// * `path` - Output file path
/// * `duration_ms` - Duration in milliseconds
/// * `frequency_hz` - Sine wave frequency in Hz (e.g., 440.0 for A4)
/// * `channels` - 1 (mono) or 2 (stereo)
pub fn generate_sine_wav<P: AsRef<Path>>(
    path: P,
    duration_ms: u64,
    frequency_hz: f32,
    channels: u16,
) -> Result<(), hound::Error> {
    let spec = WavSpec {
        channels,
        sample_rate: TEST_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)?;

    let total_frames = (TEST_SAMPLE_RATE as u64 * duration_ms) / 1000;
    let amplitude = 0.5 * i16::MAX as f32;

    for frame_idx in 0..total_frames {
        let t = frame_idx as f32 / TEST_SAMPLE_RATE as f32;
        let sample = ((2.0 * PI * frequency_hz * t).sin() * amplitude) as i16;
        for _ in 0..channels {
            writer.write_sample(sample)?;
        }
    }

    writer.finalize()?;
    Ok(())
}

/// Bytes of PCM a mono 16-bit WAV of `duration_ms` holds
pub fn mono_pcm_bytes(duration_ms: u64) -> usize {
    ((TEST_SAMPLE_RATE as u64 * duration_ms) / 1000) as usize * 2
}

/// Write a single-track MIDI file (480 ticks per quarter, 120 BPM) playing
/// `notes` one after another, each `ticks` long.
pub fn generate_midi<P: AsRef<Path>>(path: P, notes: &[u8], ticks: u32) -> std::io::Result<()> {
    let mut track = Vec::new();
    for &key in notes {
        track.extend(var_len(0));
        track.extend([0x90, key, 100]);
        track.extend(var_len(ticks));
        track.extend([0x80, key, 0]);
    }
    track.extend(var_len(0));
    track.extend([0xFF, 0x2F, 0x00]);

    let mut data = Vec::new();
    data.extend(b"MThd");
    data.extend(6u32.to_be_bytes());
    data.extend(0u16.to_be_bytes());
    data.extend(1u16.to_be_bytes());
    data.extend(480u16.to_be_bytes());
    data.extend(b"MTrk");
    data.extend((track.len() as u32).to_be_bytes());
    data.extend(track);

    std::fs::write(path, data)
}

fn var_len(mut value: u32) -> Vec<u8> {
    let mut bytes = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        bytes.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    bytes.reverse();
    bytes
}

/// Write the first `keep` bytes of a valid WAV file
pub fn generate_truncated_wav<P: AsRef<Path>>(path: P, keep: usize) -> std::io::Result<()> {
    let full = path.as_ref().with_extension("full.wav");
    generate_silent_wav(&full, 100).map_err(std::io::Error::other)?;
    let data = std::fs::read(&full)?;
    std::fs::remove_file(&full)?;
    std::fs::write(path, &data[..keep.min(data.len())])
}
