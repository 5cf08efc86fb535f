//! Error types for rgss-audio
//!
//! Only failures that happen before a background thread starts surface
//! here. Errors inside filler and fade threads degrade to flags.

use thiserror::Error;

/// Main error type for the audio engine
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Audio asset could not be resolved
    #[error("Not found: {0}")]
    NotFound(String),

    /// Signature or container not recognized by any decoder
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Track index outside the configured BGM track count
    #[error("Requested BGM track {index} out of range (track count: {count})")]
    InvalidTrack { index: i32, count: usize },

    /// Sequence backend errors
    #[error("MIDI error: {0}")]
    Midi(String),
}

impl From<rgss_common::Error> for Error {
    fn from(err: rgss_common::Error) -> Self {
        match err {
            rgss_common::Error::Io(e) => Error::Io(e),
            rgss_common::Error::Config(msg) => Error::Config(msg),
            rgss_common::Error::NotFound(msg) => Error::NotFound(msg),
            rgss_common::Error::InvalidInput(msg) => Error::NotFound(msg),
        }
    }
}

/// Convenience Result type using rgss-audio Error
pub type Result<T> = std::result::Result<T, Error>;
