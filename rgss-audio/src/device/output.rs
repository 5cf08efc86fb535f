//! Audio output drivers
//!
//! An [`OutputDriver`] owns the mixer thread that pulls frames out of an
//! [`AudioDevice`]:
//! - `Cpal`: renders ahead into a lock-free ring consumed by a cpal output
//!   stream callback
//! - `Headless`: renders at wall-clock rate and discards the result, so
//!   sources advance exactly as they would on real hardware
//!
//! The cpal stream is built on the mixer thread and never leaves it.

use super::ring_buffer::{AudioConsumer, AudioProducer, AudioRingBuffer};
use super::types::AudioFrame;
use super::AudioDevice;
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Mixer thread poll interval
const MIXER_SLEEP: Duration = Duration::from_millis(2);

/// Frames rendered per device lock
const RENDER_CHUNK_FRAMES: usize = 512;

/// Headless catch-up limit after a stall (frames)
const MAX_HEADLESS_BACKLOG_SECS: f64 = 0.25;

/// Which backend drives the mixer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Real audio hardware through cpal
    Cpal {
        /// Optional device name (None = default device)
        device_name: Option<String>,
        /// Optional buffer size in frames (None = device default)
        buffer_frames: Option<u32>,
    },

    /// No hardware; frames are consumed at wall-clock rate
    Headless,
}

/// Owner of the mixer thread. Dropping it stops output.
pub struct OutputDriver {
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    mode: OutputMode,
}

impl OutputDriver {
    /// Start driving `device` with the given backend.
    ///
    /// For cpal this blocks until the stream is running (or failed).
    pub fn start(device: AudioDevice, mode: OutputMode) -> Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop_flag);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let thread_mode = mode.clone();

        let thread = thread::Builder::new()
            .name("audio-mixer".to_string())
            .spawn(move || match thread_mode {
                OutputMode::Headless => {
                    let _ = ready_tx.send(Ok(()));
                    headless_loop(&device, &thread_stop);
                }
                OutputMode::Cpal {
                    device_name,
                    buffer_frames,
                } => {
                    let (producer, consumer) = AudioRingBuffer::new(None).split();
                    let mut output = match AudioOutput::new(device_name, buffer_frames, device.output_rate())
                        .and_then(|mut out| out.start(consumer).map(|_| out))
                    {
                        Ok(out) => out,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    cpal_loop(&device, &thread_stop, producer, &output);
                    output.stop();
                }
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn mixer thread: {}", e)))?;

        let started = ready_rx
            .recv()
            .map_err(|_| Error::AudioOutput("Mixer thread exited during startup".to_string()))?;
        if let Err(e) = started {
            let _ = thread.join();
            return Err(e);
        }

        info!("Audio output started ({:?})", mode);
        Ok(Self {
            stop_flag,
            thread: Some(thread),
            mode,
        })
    }

    /// Backend in use
    pub fn mode(&self) -> &OutputMode {
        &self.mode
    }
}

impl Drop for OutputDriver {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Mixer thread panicked");
            }
        }
        debug!("Audio output stopped");
    }
}

fn render_frames(device: &AudioDevice, scratch: &mut [f32], frames: usize, mut sink: impl FnMut(AudioFrame)) {
    let mut remaining = frames;
    while remaining > 0 {
        let chunk = remaining.min(RENDER_CHUNK_FRAMES);
        let buf = &mut scratch[..chunk * 2];
        device.render(buf);
        for pair in buf.chunks_exact(2) {
            sink(AudioFrame::from_stereo(pair[0], pair[1]).clamped());
        }
        remaining -= chunk;
    }
}

fn headless_loop(device: &AudioDevice, stop: &AtomicBool) {
    let rate = device.output_rate() as f64;
    let mut scratch = vec![0.0f32; RENDER_CHUNK_FRAMES * 2];
    let mut origin = Instant::now();
    let mut rendered: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        let due = (origin.elapsed().as_secs_f64() * rate) as u64;
        let mut backlog = due.saturating_sub(rendered);

        let max_backlog = (MAX_HEADLESS_BACKLOG_SECS * rate) as u64;
        if backlog > max_backlog {
            warn!("Headless mixer fell behind by {} frames, skipping ahead", backlog);
            origin = Instant::now();
            rendered = 0;
            backlog = 0;
        }

        if backlog > 0 {
            render_frames(device, &mut scratch, backlog as usize, |_| {});
            rendered += backlog;
        }
        thread::sleep(MIXER_SLEEP);
    }
}

fn cpal_loop(device: &AudioDevice, stop: &AtomicBool, mut producer: AudioProducer, output: &AudioOutput) {
    let mut scratch = vec![0.0f32; RENDER_CHUNK_FRAMES * 2];

    while !stop.load(Ordering::Relaxed) {
        if output.has_error() {
            warn!(
                "Audio stream reported {} error(s); continuing to render",
                output.error_count()
            );
            output.clear_error();
        }

        let vacant = producer.vacant_len();
        if vacant > 0 {
            render_frames(device, &mut scratch, vacant, |frame| {
                producer.push(frame);
            });
        }
        thread::sleep(MIXER_SLEEP);
    }
}

/// Audio output manager using cpal.
///
/// Lives on the mixer thread only.
struct AudioOutput {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    /// Stream error flag - set by audio callback on error
    error_flag: Arc<AtomicBool>,
    /// Count of consecutive errors
    error_count: Arc<AtomicU32>,
}

impl AudioOutput {
    /// Open audio device for output.
    ///
    /// If the requested device cannot be found, falls back to the default
    /// device.
    fn new(device_name: Option<String>, buffer_size: Option<u32>, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name.as_ref() {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?;

            match devices.find(|d| d.name().ok().as_ref() == Some(name)) {
                Some(dev) => {
                    info!("Found requested audio device: {}", name);
                    dev
                }
                None => {
                    warn!("Requested device '{}' not found, falling back to default device", name);
                    host.default_output_device().ok_or_else(|| {
                        Error::AudioOutput(format!(
                            "Device '{}' not found and no default device available",
                            name
                        ))
                    })?
                }
            }
        } else {
            host.default_output_device()
                .ok_or_else(|| Error::AudioOutput("No default output device found".to_string()))?
        };

        info!(
            "Using audio device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let (mut config, sample_format) = Self::get_best_config(&device, sample_rate)?;

        if let Some(size) = buffer_size {
            config.buffer_size = cpal::BufferSize::Fixed(size);
            debug!("Using requested buffer size: {} frames", size);
        }

        if config.sample_rate.0 != sample_rate {
            warn!(
                "Device runs at {} Hz, mixer renders at {} Hz; playback speed will differ",
                config.sample_rate.0, sample_rate
            );
        }

        debug!(
            "Audio config: sample_rate={}, channels={}, format={:?}, buffer_size={:?}",
            config.sample_rate.0, config.channels, sample_format, config.buffer_size
        );

        Ok(Self {
            device,
            config,
            sample_format,
            stream: None,
            error_flag: Arc::new(AtomicBool::new(false)),
            error_count: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Get the best supported configuration for playback.
    ///
    /// Prefers the mixer rate, stereo, f32 samples.
    fn get_best_config(device: &Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
        let mut supported_configs = device
            .supported_output_configs()
            .map_err(|e| Error::AudioOutput(format!("Failed to get device configs: {}", e)))?;

        let preferred = supported_configs.find(|config| {
            config.channels() == 2
                && config.min_sample_rate().0 <= sample_rate
                && config.max_sample_rate().0 >= sample_rate
                && config.sample_format() == SampleFormat::F32
        });

        if let Some(supported_config) = preferred {
            let sample_format = supported_config.sample_format();
            let config = supported_config
                .with_sample_rate(cpal::SampleRate(sample_rate))
                .config();
            return Ok((config, sample_format));
        }

        // Fallback: use default config
        let supported_config = device
            .default_output_config()
            .map_err(|e| Error::AudioOutput(format!("Failed to get default config: {}", e)))?;

        let sample_format = supported_config.sample_format();
        Ok((supported_config.config(), sample_format))
    }

    /// Start the output stream pulling frames from `consumer`.
    fn start(&mut self, consumer: AudioConsumer) -> Result<()> {
        let consumer = Arc::new(Mutex::new(consumer));

        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream::<f32>(consumer, |s| s)?,
            SampleFormat::I16 => self.build_stream::<i16>(consumer, |s| (s * i16::MAX as f32) as i16)?,
            // Convert from [-1.0, 1.0] to [0, 65535]
            SampleFormat::U16 => self.build_stream::<u16>(consumer, |s| ((s + 1.0) * 32767.5) as u16)?,
            sample_format => {
                return Err(Error::AudioOutput(format!(
                    "Unsupported sample format: {:?}",
                    sample_format
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {}", e)))?;

        self.stream = Some(stream);
        info!("Audio stream started successfully");
        Ok(())
    }

    /// Build an output stream for sample type `T`
    fn build_stream<T>(
        &self,
        consumer: Arc<Mutex<AudioConsumer>>,
        convert: fn(f32) -> T,
    ) -> Result<Stream>
    where
        T: cpal::SizedSample + Send + 'static,
    {
        let channels = self.config.channels as usize;
        let error_flag = Arc::clone(&self.error_flag);
        let error_count = Arc::clone(&self.error_count);

        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    // Only this callback ever locks the consumer
                    let mut consumer = consumer.lock();
                    for frame in data.chunks_mut(channels) {
                        let audio_frame = consumer.pop().unwrap_or_default();
                        frame[0] = convert(audio_frame.left);
                        if channels > 1 {
                            frame[1] = convert(audio_frame.right);
                        }
                        for extra in frame.iter_mut().skip(2) {
                            *extra = convert(0.0);
                        }
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    error_flag.store(true, Ordering::SeqCst);
                    error_count.fetch_add(1, Ordering::SeqCst);
                },
                None, // No timeout
            )
            .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))
    }

    /// Stop audio playback and drop the stream.
    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause stream: {}", e);
            }
        }
    }

    fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }

    fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    fn clear_error(&self) {
        self.error_flag.store(false, Ordering::SeqCst);
        self.error_count.store(0, Ordering::SeqCst);
    }
}
