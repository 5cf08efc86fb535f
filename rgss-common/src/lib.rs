//! # RGSS Common Library
//!
//! Shared code for the RGSS runtime subsystems including:
//! - Error types shared by collaborators
//! - The virtual filesystem contract consumed by the audio engine
//! - Configuration file resolution
//! - Fade curve definitions

pub mod config;
pub mod error;
pub mod fade_curves;
pub mod fs;

pub use error::{Error, Result};
pub use fade_curves::FadeCurve;
pub use fs::{DirFileSystem, FileSystem, OpenedFile, ReadSeek};
