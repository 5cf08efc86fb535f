//! Decoder backends
//!
//! Every decoder is a [`PcmReader`]: a pull-style producer of interleaved
//! 16-bit PCM with optional seeking and loop markers. The stream engine does
//! not talk to readers directly; it drives a [`DataSource`], which
//! [`LoopingSource`] implements on top of any reader by adding chunked
//! uploads into device buffers and loop/wrap-around handling.
//!
//! The decoder variant is chosen once by sniffing a 4-byte signature:
//! - `MThd`: standard MIDI file, rendered through the synth pool
//! - `OggS`: Ogg Vorbis through symphonia, honouring `LOOPSTART`/`LOOPLENGTH`
//! - `RIFF`: PCM WAV through hound (symphonia fallback for other codecs)
//! - anything else: symphonia's generic probe with the extension hint

pub mod compressed;
pub mod midi;
pub mod raw;

use crate::device::{AudioDevice, BufferFormat, BufferId};
use crate::error::{Error, Result};
use rgss_common::{FileSystem, OpenedFile};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use tracing::{debug, warn};

pub use midi::MidiState;

/// Upper bound of PCM bytes uploaded per `fill_buffer` call
pub const STREAM_CHUNK_BYTES: usize = 32 * 1024;

/// Result of filling one device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// Buffer filled, more data follows
    NoError,

    /// Physical end of data reached; the buffer holds the tail (possibly empty)
    EndOfStream,

    /// Loop end reached; the decoder has already seeked back to its loop start
    WrapAround,

    /// Unrecoverable decode failure
    Error,
}

/// Contract between the stream engine and a decoder.
pub trait DataSource: Send {
    /// Decode the next chunk and upload it into `buf`.
    fn fill_buffer(&mut self, device: &AudioDevice, buf: BufferId) -> FillStatus;

    /// Sample rate of the produced PCM
    fn sample_rate(&self) -> u32;

    /// Absolute seek. Looped sources clamp offsets past the loop end back to
    /// the loop start; sources without native seek restart from zero.
    fn seek_to_offset(&mut self, seconds: f32);

    /// Frame position playback continues from after a wrap-around
    fn loop_start_frames(&self) -> u64;

    /// Attempt a native pitch shift; `false` means the caller must emulate it
    fn set_pitch(&mut self, _value: f32) -> bool {
        false
    }
}

/// Loop region of a reader, in frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopPoints {
    /// First frame of the loop
    pub start: u64,

    /// One past the last looped frame (None = physical end)
    pub end: Option<u64>,
}

/// Pull-style PCM producer implemented by every decoder backend.
pub trait PcmReader: Send {
    /// Output channel count (1 or 2)
    fn channels(&self) -> u16;

    /// Output sample rate
    fn sample_rate(&self) -> u32;

    /// Total frames, when the container tells us
    fn total_frames(&self) -> Option<u64>;

    /// Append up to `max_frames` frames to `out`. `Ok(0)` means end of data.
    fn read(&mut self, out: &mut Vec<i16>, max_frames: usize) -> Result<usize>;

    /// Seek to an absolute frame.
    fn seek_frame(&mut self, frame: u64) -> Result<()>;

    /// Loop markers embedded in the source
    fn loop_points(&self) -> LoopPoints {
        LoopPoints::default()
    }

    /// Native pitch shift (see [`DataSource::set_pitch`])
    fn set_pitch(&mut self, _value: f32) -> bool {
        false
    }
}

/// Fully decoded sound, used by the one-shot cache
#[derive(Debug, Clone)]
pub struct DecodedSound {
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl DecodedSound {
    /// PCM payload size in bytes
    pub fn byte_size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<i16>()
    }

    pub fn format(&self) -> BufferFormat {
        BufferFormat::for_channels(self.channels)
    }
}

/// Streaming [`DataSource`] over any [`PcmReader`].
pub struct LoopingSource {
    reader: Box<dyn PcmReader>,
    looped: bool,
    loop_points: LoopPoints,
    /// Frame position of the reader
    position: u64,
    scratch: Vec<i16>,
    /// Frames read ahead of the last chunk, consumed by the next fill
    carry: Vec<i16>,
}

impl LoopingSource {
    pub fn new(reader: Box<dyn PcmReader>, looped: bool) -> Self {
        let mut loop_points = reader.loop_points();
        if let Some(total) = reader.total_frames() {
            loop_points.end = Some(loop_points.end.map_or(total, |end| end.min(total)));
        }
        if loop_points.end.is_some_and(|end| loop_points.start >= end) {
            warn!(
                "Loop start {} past loop end {:?}, looping from the beginning",
                loop_points.start, loop_points.end
            );
            loop_points.start = 0;
        }

        Self {
            reader,
            looped,
            loop_points,
            position: 0,
            scratch: Vec::with_capacity(STREAM_CHUNK_BYTES / 2),
            carry: Vec::new(),
        }
    }

    /// Whether reaching the end wraps to the loop start
    pub fn is_looped(&self) -> bool {
        self.looped
    }

    pub fn loop_points(&self) -> LoopPoints {
        self.loop_points
    }

    fn channels(&self) -> usize {
        self.reader.channels().max(1) as usize
    }

    fn wrap(&mut self) -> Result<()> {
        self.reader.seek_frame(self.loop_points.start)?;
        self.position = self.loop_points.start;
        self.carry.clear();
        Ok(())
    }

    fn fill_scratch(&mut self) -> Result<FillStatus> {
        let channels = self.channels();
        let chunk_frames = (STREAM_CHUNK_BYTES / 2 / channels).max(1);
        self.scratch.clear();
        self.scratch.append(&mut self.carry);

        let mut wrapped_empty = false;
        loop {
            let have = self.scratch.len() / channels;
            if have >= chunk_frames {
                // Without a known end, look one frame ahead so a loop end on
                // the chunk boundary is reported with this buffer.
                if self.looped && self.loop_points.end.is_none() {
                    let got = self.reader.read(&mut self.carry, 1)?;
                    self.position += got as u64;
                    if got == 0 {
                        self.wrap()?;
                        return Ok(FillStatus::WrapAround);
                    }
                }
                return Ok(FillStatus::NoError);
            }

            let mut want = chunk_frames - have;
            if let Some(end) = self.loop_points.end {
                want = want.min(end.saturating_sub(self.position) as usize);
            }
            let got = if want == 0 {
                0
            } else {
                self.reader.read(&mut self.scratch, want)?
            };
            self.position += got as u64;

            let at_end = got == 0 || self.loop_points.end.is_some_and(|end| self.position >= end);
            if !at_end {
                continue;
            }
            if !self.looped {
                return Ok(FillStatus::EndOfStream);
            }

            self.wrap()?;
            if !self.scratch.is_empty() {
                return Ok(FillStatus::WrapAround);
            }
            // End landed exactly on a chunk boundary; keep filling from the
            // loop start unless the loop itself is empty.
            if wrapped_empty {
                return Ok(FillStatus::EndOfStream);
            }
            wrapped_empty = true;
        }
    }
}

impl DataSource for LoopingSource {
    fn fill_buffer(&mut self, device: &AudioDevice, buf: BufferId) -> FillStatus {
        let status = match self.fill_scratch() {
            Ok(status) => status,
            Err(e) => {
                warn!("Decoder failed mid-stream: {}", e);
                return FillStatus::Error;
            }
        };

        device.buffer_data(
            buf,
            BufferFormat::for_channels(self.reader.channels()),
            &self.scratch,
            self.reader.sample_rate(),
        );
        status
    }

    fn sample_rate(&self) -> u32 {
        self.reader.sample_rate()
    }

    fn seek_to_offset(&mut self, seconds: f32) {
        let mut frame = (seconds.max(0.0) as f64 * self.reader.sample_rate() as f64) as u64;
        if self.looped && self.loop_points.end.is_some_and(|end| frame >= end) {
            frame = self.loop_points.start;
        }

        self.carry.clear();
        match self.reader.seek_frame(frame) {
            Ok(()) => self.position = frame,
            Err(e) => {
                debug!("Seek to frame {} unsupported ({}), restarting from zero", frame, e);
                match self.reader.seek_frame(0) {
                    Ok(()) => self.position = 0,
                    Err(e) => warn!("Failed to rewind decoder: {}", e),
                }
            }
        }
    }

    fn loop_start_frames(&self) -> u64 {
        self.loop_points.start
    }

    fn set_pitch(&mut self, value: f32) -> bool {
        self.reader.set_pitch(value)
    }
}

/// Resolve `path` and construct the matching reader.
pub fn open_reader(fs: &dyn FileSystem, path: &str, midi: &MidiState) -> Result<Box<dyn PcmReader>> {
    let OpenedFile {
        mut reader,
        extension,
        resolved,
    } = fs.open_read(path)?;

    let mut signature = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut signature) {
        return Err(match e.kind() {
            ErrorKind::UnexpectedEof => Error::UnsupportedFormat(format!(
                "{}: file too short to identify",
                resolved.display()
            )),
            _ => Error::Io(e),
        });
    }
    reader.seek(SeekFrom::Start(0))?;

    debug!("Opening {} (signature {:?})", resolved.display(), signature);

    match &signature {
        b"MThd" => Ok(Box::new(midi::MidiReader::open(reader, midi)?)),
        b"OggS" => Ok(Box::new(compressed::CompressedReader::open(reader, Some("ogg"))?)),
        b"RIFF" => match raw::RawReader::open(reader) {
            Ok(raw) => Ok(Box::new(raw)),
            Err(e) => {
                debug!("WAV reader rejected {} ({}), trying container probe", resolved.display(), e);
                let reopened = fs.open_read(path)?;
                Ok(Box::new(compressed::CompressedReader::open(reopened.reader, Some("wav"))?))
            }
        },
        _ => Ok(Box::new(compressed::CompressedReader::open(reader, extension.as_deref())?)),
    }
}

/// Open `path` as a streaming data source.
pub fn open_source(
    fs: &dyn FileSystem,
    path: &str,
    looped: bool,
    midi: &MidiState,
) -> Result<Box<dyn DataSource>> {
    let reader = open_reader(fs, path, midi)?;
    Ok(Box::new(LoopingSource::new(reader, looped)))
}

/// Decode `path` completely into memory.
pub fn decode_all(fs: &dyn FileSystem, path: &str, midi: &MidiState) -> Result<DecodedSound> {
    let mut reader = open_reader(fs, path, midi)?;
    let channels = reader.channels();
    let sample_rate = reader.sample_rate();

    let mut samples = Vec::new();
    if let Some(total) = reader.total_frames() {
        samples.reserve(total as usize * channels as usize);
    }
    while reader.read(&mut samples, STREAM_CHUNK_BYTES / 2)? > 0 {}

    Ok(DecodedSound {
        samples,
        channels,
        sample_rate,
    })
}
