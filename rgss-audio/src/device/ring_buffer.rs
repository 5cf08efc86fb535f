//! Lock-free ring buffer for mixed audio frames
//!
//! The real-time output callback must never block on the device mutex, so
//! the mixer thread renders ahead into a single-producer single-consumer
//! ring and the callback only pops frames.
//!
//! Design:
//! - Producer (mixer thread): keeps the ring topped up with rendered frames
//! - Consumer (output callback): reads frames without any locks
//! - Underruns/overruns are counted and logged sparsely

use super::types::AudioFrame;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Default ring size in frames (~46ms @ 44.1kHz)
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Lock-free ring buffer for audio frames
pub struct AudioRingBuffer {
    /// Ring buffer (internally uses atomics for lock-free operation)
    buffer: HeapRb<AudioFrame>,

    /// Underrun counter (output callback found buffer empty)
    underruns: Arc<AtomicU64>,

    /// Overrun counter (mixer found buffer full)
    overruns: Arc<AtomicU64>,
}

impl AudioRingBuffer {
    /// Create a new audio ring buffer
    ///
    /// # Arguments
    /// * `capacity` - Buffer size in frames (default: 2048 frames)
    pub fn new(capacity: Option<usize>) -> Self {
        let capacity = capacity.unwrap_or(DEFAULT_BUFFER_SIZE).max(1);
        debug!("Creating audio ring buffer with capacity: {} frames", capacity);

        Self {
            buffer: HeapRb::new(capacity),
            underruns: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Split into producer and consumer halves
    ///
    /// Producer is used by mixer thread, consumer by output callback.
    pub fn split(self) -> (AudioProducer, AudioConsumer) {
        let (prod, cons) = self.buffer.split();

        let producer = AudioProducer {
            producer: prod,
            overruns: Arc::clone(&self.overruns),
        };

        let consumer = AudioConsumer {
            consumer: cons,
            underruns: Arc::clone(&self.underruns),
        };

        (producer, consumer)
    }
}

/// Producer half of ring buffer (used by mixer thread)
pub struct AudioProducer {
    producer: ringbuf::HeapProd<AudioFrame>,
    overruns: Arc<AtomicU64>,
}

impl AudioProducer {
    /// Push an audio frame to the buffer
    ///
    /// Returns true if frame was pushed, false if buffer was full (overrun).
    pub fn push(&mut self, frame: AudioFrame) -> bool {
        match self.producer.try_push(frame) {
            Ok(()) => true,
            Err(_) => {
                let count = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 1000 == 0 {
                    warn!("Audio ring buffer overrun (total: {})", count);
                }
                false
            }
        }
    }

    /// Free slots the mixer may render into without overrunning
    pub fn vacant_len(&self) -> usize {
        self.producer.vacant_len()
    }

    /// Get current buffer fill level
    pub fn occupied_len(&self) -> usize {
        self.producer.occupied_len()
    }

    /// Total overruns so far
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Consumer half of ring buffer (used by output callback)
pub struct AudioConsumer {
    consumer: ringbuf::HeapCons<AudioFrame>,
    underruns: Arc<AtomicU64>,
}

impl AudioConsumer {
    /// Pop an audio frame from the buffer
    ///
    /// Returns None on underrun; the caller outputs silence in that case.
    pub fn pop(&mut self) -> Option<AudioFrame> {
        match self.consumer.try_pop() {
            Some(frame) => Some(frame),
            None => {
                let count = self.underruns.fetch_add(1, Ordering::Relaxed) + 1;
                // Log every 1000th underrun to avoid spam
                if count % 1000 == 0 {
                    trace!("Audio ring buffer underrun (total: {})", count);
                }
                None
            }
        }
    }

    /// Total underruns so far
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}
