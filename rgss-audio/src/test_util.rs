//! In-memory fixtures shared by unit tests

use hound::{SampleFormat, WavSpec, WavWriter};
use rgss_common::{Error, FileSystem, OpenedFile, Result};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;

/// 16-bit WAV of a quiet square-ish tone, held in memory.
pub fn write_wav(sample_rate: u32, channels: u16, frames: u32) -> Vec<u8> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
    for frame in 0..frames {
        let value: i16 = if (frame / 20) % 2 == 0 { 4000 } else { -4000 };
        for _ in 0..channels {
            writer.write_sample(value).unwrap();
        }
    }
    writer.finalize().unwrap();
    cursor.into_inner()
}

/// Filesystem serving byte blobs by exact path
#[derive(Debug, Default, Clone)]
pub struct MemoryFileSystem {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryFileSystem {
    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }
}

impl FileSystem for MemoryFileSystem {
    fn open_read(&self, path: &str) -> Result<OpenedFile> {
        let data = self
            .files
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok(OpenedFile {
            reader: Box::new(Cursor::new(data.clone())),
            extension: Some("wav".to_string()),
            resolved: PathBuf::from(path),
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}
