//! Pass-through WAV decoder using hound
//!
//! Uncompressed RIFF/WAVE data is read sample by sample and converted to
//! 16-bit: 8/24/32-bit integer PCM is shifted, float PCM is scaled.

use super::PcmReader;
use crate::error::{Error, Result};
use hound::{SampleFormat, WavReader};
use rgss_common::ReadSeek;
use std::io::BufReader;
use tracing::debug;

/// Streaming reader over an uncompressed WAV file.
pub struct RawReader {
    reader: WavReader<BufReader<Box<dyn ReadSeek>>>,
    source_channels: u16,
    channels: u16,
    sample_rate: u32,
    bits: u16,
    format: SampleFormat,
    total_frames: u64,
}

impl RawReader {
    /// Parse the WAV header. Fails for non-PCM codecs.
    pub fn open(reader: Box<dyn ReadSeek>) -> Result<Self> {
        let reader = WavReader::new(BufReader::new(reader))
            .map_err(|e| Error::Decode(format!("Invalid WAV data: {}", e)))?;

        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(Error::Decode("WAV file declares zero channels".to_string()));
        }
        match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 8 | 16 | 24 | 32) | (SampleFormat::Float, 32) => {}
            (format, bits) => {
                return Err(Error::UnsupportedFormat(format!(
                    "{:?} WAV with {} bits per sample",
                    format, bits
                )));
            }
        }

        let total_frames = reader.duration() as u64;
        debug!(
            "WAV stream: sample_rate={}, channels={}, bits={}, frames={}",
            spec.sample_rate, spec.channels, spec.bits_per_sample, total_frames
        );

        Ok(Self {
            reader,
            source_channels: spec.channels,
            channels: spec.channels.min(2),
            sample_rate: spec.sample_rate,
            bits: spec.bits_per_sample,
            format: spec.sample_format,
            total_frames,
        })
    }

    /// Read one frame's worth of samples, converted to 16-bit
    fn read_frame(&mut self, frame: &mut [i16]) -> Result<bool> {
        let n = self.source_channels as usize;
        match self.format {
            SampleFormat::Float => {
                let mut samples = self.reader.samples::<f32>();
                for slot in frame.iter_mut().take(n) {
                    match samples.next() {
                        Some(s) => {
                            let s = s.map_err(|e| Error::Decode(format!("WAV read failed: {}", e)))?;
                            *slot = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        }
                        None => return Ok(false),
                    }
                }
            }
            SampleFormat::Int => {
                let shift_down = self.bits.saturating_sub(16) as u32;
                let shift_up = 16u16.saturating_sub(self.bits) as u32;
                let mut samples = self.reader.samples::<i32>();
                for slot in frame.iter_mut().take(n) {
                    match samples.next() {
                        Some(s) => {
                            let s = s.map_err(|e| Error::Decode(format!("WAV read failed: {}", e)))?;
                            *slot = ((s >> shift_down) << shift_up) as i16;
                        }
                        None => return Ok(false),
                    }
                }
            }
        }
        Ok(true)
    }
}

impl PcmReader for RawReader {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.total_frames)
    }

    fn read(&mut self, out: &mut Vec<i16>, max_frames: usize) -> Result<usize> {
        let keep = self.channels as usize;
        let mut frame = vec![0i16; self.source_channels as usize];

        for done in 0..max_frames {
            if !self.read_frame(&mut frame)? {
                return Ok(done);
            }
            out.extend_from_slice(&frame[..keep]);
        }
        Ok(max_frames)
    }

    fn seek_frame(&mut self, frame: u64) -> Result<()> {
        let frame = frame.min(self.total_frames) as u32;
        self.reader
            .seek(frame)
            .map_err(|e| Error::Decode(format!("WAV seek failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav(spec: hound::WavSpec, frames: u32, sample: impl Fn(u32, u16) -> f64) -> Box<dyn ReadSeek> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                for ch in 0..spec.channels {
                    let v = sample(i, ch);
                    match (spec.sample_format, spec.bits_per_sample) {
                        (hound::SampleFormat::Float, _) => writer.write_sample(v as f32).unwrap(),
                        (_, 8) => writer.write_sample(v as i8).unwrap(),
                        (_, 16) => writer.write_sample(v as i16).unwrap(),
                        _ => writer.write_sample(v as i32).unwrap(),
                    }
                }
            }
            writer.finalize().unwrap();
        }
        cursor.set_position(0);
        Box::new(cursor)
    }

    fn spec(channels: u16, bits: u16, format: hound::SampleFormat) -> hound::WavSpec {
        hound::WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: bits,
            sample_format: format,
        }
    }

    #[test]
    fn test_reads_16_bit_stereo() {
        let data = wav(spec(2, 16, hound::SampleFormat::Int), 100, |i, ch| {
            if ch == 0 {
                i as f64
            } else {
                -(i as f64)
            }
        });
        let mut reader = RawReader::open(data).unwrap();
        assert_eq!(reader.total_frames(), Some(100));

        let mut out = Vec::new();
        assert_eq!(reader.read(&mut out, 60).unwrap(), 60);
        assert_eq!(reader.read(&mut out, 60).unwrap(), 40);
        assert_eq!(reader.read(&mut out, 60).unwrap(), 0);
        assert_eq!(&out[20..22], &[10, -10]);
    }

    #[test]
    fn test_converts_bit_depths() {
        let data = wav(spec(1, 8, hound::SampleFormat::Int), 4, |_, _| 64.0);
        let mut out = Vec::new();
        RawReader::open(data).unwrap().read(&mut out, 4).unwrap();
        assert_eq!(out[0], 64 << 8);

        let data = wav(spec(1, 24, hound::SampleFormat::Int), 4, |_, _| 0x10_0000 as f64);
        let mut out = Vec::new();
        RawReader::open(data).unwrap().read(&mut out, 4).unwrap();
        assert_eq!(out[0], 0x1000);

        let data = wav(spec(1, 32, hound::SampleFormat::Float), 4, |_, _| 0.5);
        let mut out = Vec::new();
        RawReader::open(data).unwrap().read(&mut out, 4).unwrap();
        assert_eq!(out[0], i16::MAX / 2);
    }

    #[test]
    fn test_folds_to_two_channels() {
        let data = wav(spec(3, 16, hound::SampleFormat::Int), 10, |i, ch| (i * 10 + ch as u32) as f64);
        let mut reader = RawReader::open(data).unwrap();
        assert_eq!(reader.channels(), 2);
        let mut out = Vec::new();
        reader.read(&mut out, 10).unwrap();
        assert_eq!(out.len(), 20);
        assert_eq!(&out[4..6], &[20, 21]);
    }

    #[test]
    fn test_seek() {
        let data = wav(spec(1, 16, hound::SampleFormat::Int), 1000, |i, _| i as f64);
        let mut reader = RawReader::open(data).unwrap();
        reader.seek_frame(500).unwrap();
        let mut out = Vec::new();
        reader.read(&mut out, 1).unwrap();
        assert_eq!(out[0], 500);
    }

    #[test]
    fn test_rejects_truncated_header() {
        let data: Box<dyn ReadSeek> = Box::new(Cursor::new(b"RIFF\x10\x00\x00\x00WAVE".to_vec()));
        assert!(RawReader::open(data).is_err());
    }
}
