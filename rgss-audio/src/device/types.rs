//! Core audio data types
//!
//! Defines the PCM formats accepted by device buffers and the stereo frame
//! passed from the mixer thread to the output callback.

/// PCM layout of a device buffer.
///
/// All decoders deliver signed 16-bit interleaved samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    /// One channel, 16 bits per sample
    Mono16,

    /// Two interleaved channels, 16 bits per sample
    Stereo16,
}

impl BufferFormat {
    /// Pick the format for a channel count (anything above mono is stereo)
    pub fn for_channels(channels: u16) -> Self {
        if channels <= 1 {
            BufferFormat::Mono16
        } else {
            BufferFormat::Stereo16
        }
    }

    /// Channel count
    pub fn channels(&self) -> u16 {
        match self {
            BufferFormat::Mono16 => 1,
            BufferFormat::Stereo16 => 2,
        }
    }

    /// Bit depth of one sample
    pub fn bits(&self) -> u16 {
        16
    }
}

/// AudioFrame represents a single stereo sample (one frame of audio).
///
/// Used for passing audio data between mixer and output device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioFrame {
    /// Left channel sample
    pub left: f32,

    /// Right channel sample
    pub right: f32,
}

impl AudioFrame {
    /// Create a silent frame (0.0, 0.0)
    pub fn zero() -> Self {
        AudioFrame { left: 0.0, right: 0.0 }
    }

    /// Create a frame from left and right samples
    pub fn from_stereo(left: f32, right: f32) -> Self {
        AudioFrame { left, right }
    }

    /// Clamp samples to valid range [-1.0, 1.0] to prevent clipping
    pub fn clamped(self) -> Self {
        AudioFrame {
            left: self.left.clamp(-1.0, 1.0),
            right: self.right.clamp(-1.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_for_channels() {
        assert_eq!(BufferFormat::for_channels(1), BufferFormat::Mono16);
        assert_eq!(BufferFormat::for_channels(2), BufferFormat::Stereo16);
        assert_eq!(BufferFormat::for_channels(6), BufferFormat::Stereo16);
        assert_eq!(BufferFormat::Stereo16.channels(), 2);
        assert_eq!(BufferFormat::Mono16.bits(), 16);
    }

    #[test]
    fn test_frame_clamp() {
        let frame = AudioFrame::from_stereo(1.5, -2.0).clamped();
        assert_eq!(frame, AudioFrame::from_stereo(1.0, -1.0));
    }
}
