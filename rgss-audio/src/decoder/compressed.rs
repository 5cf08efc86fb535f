//! Compressed audio decoder using symphonia
//!
//! Decodes Ogg Vorbis, MP3, FLAC and whatever else symphonia's default
//! registry knows into 16-bit PCM, a packet at a time. Vorbis comment tags
//! `LOOPSTART` / `LOOPLENGTH` (in frames) become the reader's loop points.

use super::{LoopPoints, PcmReader};
use crate::error::{Error, Result};
use rgss_common::ReadSeek;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::{MetadataOptions, MetadataRevision};
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, warn};

/// Adapter exposing a virtual-filesystem stream to symphonia
struct StreamSource(Box<dyn ReadSeek>);

impl Read for StreamSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Seek for StreamSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.0.seek(pos)
    }
}

impl MediaSource for StreamSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Packet-at-a-time symphonia decoder.
pub struct CompressedReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    /// Output channels (source channels folded to at most 2)
    channels: u16,
    time_base: Option<TimeBase>,
    total_frames: Option<u64>,
    loop_points: LoopPoints,
    /// Decoded samples not yet handed out, interleaved at `channels`
    pending: Vec<i16>,
    pending_pos: usize,
    /// Frames to drop after an accurate seek landed early
    skip_frames: u64,
    sample_buf: Option<SampleBuffer<i16>>,
}

impl CompressedReader {
    /// Probe `reader` and set up a decoder for its first audio track.
    pub fn open(reader: Box<dyn ReadSeek>, extension: Option<&str>) -> Result<Self> {
        let mss = MediaSourceStream::new(Box::new(StreamSource(reader)), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension {
            hint.with_extension(ext);
        }

        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::UnsupportedFormat(format!("Failed to probe format: {}", e)))?;

        let mut loop_points = probed
            .metadata
            .get()
            .and_then(|m| m.current().map(loop_points_from_tags))
            .unwrap_or_default();

        let mut format = probed.format;
        if loop_points == LoopPoints::default() {
            if let Some(rev) = format.metadata().current() {
                loop_points = loop_points_from_tags(rev);
            }
        }

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("No audio track found".to_string()))?;

        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| Error::Decode("Sample rate not found".to_string()))?;
        let source_channels = params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::Decode("Channel count not found".to_string()))?;
        let channels = source_channels.clamp(1, 2);

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| Error::UnsupportedFormat(format!("Failed to create decoder: {}", e)))?;

        debug!(
            "Compressed stream: sample_rate={}, channels={} (source {}), frames={:?}, loop={:?}",
            sample_rate, channels, source_channels, params.n_frames, loop_points
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            time_base: params.time_base,
            total_frames: params.n_frames,
            loop_points,
            pending: Vec::new(),
            pending_pos: 0,
            skip_frames: 0,
            sample_buf: None,
        })
    }

    /// Decode the next packet of our track into `pending`.
    ///
    /// Returns `Ok(false)` at end of stream.
    fn decode_next(&mut self) -> Result<bool> {
        let mut reset_retried = false;

        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) if !reset_retried => {
                    reset_retried = true;
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(Error::Decode(format!("Failed to read packet: {}", e))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(msg)) => {
                    warn!("Skipping undecodable packet: {}", msg);
                    continue;
                }
                Err(SymphoniaError::IoError(ref e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) if !reset_retried => {
                    reset_retried = true;
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(Error::Decode(format!("Decode failed: {}", e))),
            };

            let spec = *decoded.spec();
            let capacity = decoded.capacity() as u64;
            let needs_alloc = self
                .sample_buf
                .as_ref()
                .map_or(true, |b| b.capacity() < capacity as usize * spec.channels.count());
            if needs_alloc {
                self.sample_buf = Some(SampleBuffer::new(capacity, spec));
            }
            let Some(sample_buf) = self.sample_buf.as_mut() else {
                continue;
            };
            sample_buf.copy_interleaved_ref(decoded);

            let src_channels = spec.channels.count().max(1);
            let out_channels = self.channels as usize;
            self.pending.clear();
            self.pending_pos = 0;
            if src_channels == out_channels {
                self.pending.extend_from_slice(sample_buf.samples());
            } else {
                for frame in sample_buf.samples().chunks_exact(src_channels) {
                    self.pending.extend_from_slice(&frame[..out_channels.min(src_channels)]);
                    if out_channels > src_channels {
                        self.pending.push(frame[0]);
                    }
                }
            }

            if self.skip_frames > 0 {
                let frames = (self.pending.len() / out_channels) as u64;
                let skip = self.skip_frames.min(frames);
                self.pending_pos = skip as usize * out_channels;
                self.skip_frames -= skip;
            }
            return Ok(true);
        }
    }

    fn ts_to_frames(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                ((time.seconds as f64 + time.frac) * self.sample_rate as f64).round() as u64
            }
            None => ts,
        }
    }
}

impl PcmReader for CompressedReader {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn read(&mut self, out: &mut Vec<i16>, max_frames: usize) -> Result<usize> {
        let channels = self.channels as usize;
        let wanted = max_frames * channels;
        let mut written = 0;

        while written < wanted {
            if self.pending_pos >= self.pending.len() {
                if !self.decode_next()? {
                    break;
                }
                continue;
            }
            let available = &self.pending[self.pending_pos..];
            let n = (wanted - written).min(available.len());
            out.extend_from_slice(&available[..n]);
            self.pending_pos += n;
            written += n;
        }

        Ok(written / channels)
    }

    fn seek_frame(&mut self, frame: u64) -> Result<()> {
        let seconds = frame / self.sample_rate as u64;
        let frac = (frame % self.sample_rate as u64) as f64 / self.sample_rate as f64;

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::new(seconds, frac),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Decode(format!("Seek to frame {} failed: {}", frame, e)))?;

        self.decoder.reset();
        self.pending.clear();
        self.pending_pos = 0;
        self.skip_frames = self
            .ts_to_frames(seeked.required_ts)
            .saturating_sub(self.ts_to_frames(seeked.actual_ts));
        Ok(())
    }

    fn loop_points(&self) -> LoopPoints {
        self.loop_points
    }
}

/// Read RPG Maker style loop markers from a tag revision.
fn loop_points_from_tags(rev: &MetadataRevision) -> LoopPoints {
    let mut start = None;
    let mut length = None;

    for tag in rev.tags() {
        let value = tag.value.to_string();
        match tag.key.to_ascii_uppercase().as_str() {
            "LOOPSTART" => start = value.trim().parse::<u64>().ok(),
            "LOOPLENGTH" => length = value.trim().parse::<u64>().ok(),
            _ => {}
        }
    }

    match start {
        Some(start) => LoopPoints {
            start,
            end: length.filter(|l| *l > 0).map(|l| start + l),
        },
        None => LoopPoints::default(),
    }
}
