//! Virtual filesystem contract
//!
//! Game scripts address assets by extension-less, case-insensitive paths
//! such as `Audio/BGM/Town01`. A [`FileSystem`] resolves such a path to a
//! readable byte stream plus the extension it was found under, which
//! consumers may use as a format hint.

use crate::{Error, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Byte stream handed out by a [`FileSystem`].
pub trait ReadSeek: Read + Seek + Send + Sync {}

impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

/// A resolved, opened asset.
pub struct OpenedFile {
    /// Stream positioned at the first byte
    pub reader: Box<dyn ReadSeek>,

    /// Extension of the resolved file, lowercase, without the dot
    pub extension: Option<String>,

    /// Fully resolved path (for diagnostics)
    pub resolved: PathBuf,
}

impl std::fmt::Debug for OpenedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedFile")
            .field("extension", &self.extension)
            .field("resolved", &self.resolved)
            .finish()
    }
}

/// Data-source provider consumed by the audio engine.
pub trait FileSystem: Send + Sync {
    /// Resolve `path` and open it for reading.
    fn open_read(&self, path: &str) -> Result<OpenedFile>;

    /// Whether `path` resolves to an existing file.
    fn exists(&self, path: &str) -> bool;
}

/// Directory-backed filesystem with extension probing and
/// case-insensitive name matching.
#[derive(Debug, Clone)]
pub struct DirFileSystem {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DirFileSystem {
    /// Extensions tried, in order, when a path is given without one
    pub const AUDIO_EXTENSIONS: &'static [&'static str] =
        &["ogg", "wav", "mp3", "flac", "mid", "midi", "wma"];

    /// Create a filesystem rooted at `root` probing the audio extensions.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_extensions(root, Self::AUDIO_EXTENSIONS.iter().copied())
    }

    /// Create a filesystem rooted at `root` probing `extensions`.
    pub fn with_extensions<'a>(
        root: impl Into<PathBuf>,
        extensions: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            root: root.into(),
            extensions: extensions.into_iter().map(|e| e.to_ascii_lowercase()).collect(),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a script path to a file on disk.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let normalized = path.replace('\\', "/");
        let relative = normalized.trim_start_matches('/');
        if relative.is_empty() {
            return Err(Error::InvalidInput("empty path".to_string()));
        }

        let direct = self.root.join(relative);
        if direct.is_file() {
            trace!("Resolved {} directly", path);
            return Ok(direct);
        }

        let (dir_part, name) = match relative.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, relative),
        };
        let dir = match dir_part {
            Some(dir) => self.resolve_dir(dir)?,
            None => self.root.clone(),
        };

        self.find_in_dir(&dir, name)
            .ok_or_else(|| Error::NotFound(format!("No such file: {}", path)))
    }

    /// Walk each directory component case-insensitively.
    fn resolve_dir(&self, dir: &str) -> Result<PathBuf> {
        let mut current = self.root.clone();
        for component in dir.split('/').filter(|c| !c.is_empty()) {
            let exact = current.join(component);
            if exact.is_dir() {
                current = exact;
                continue;
            }
            current = std::fs::read_dir(&current)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .find(|p| {
                    p.is_dir()
                        && p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.eq_ignore_ascii_case(component))
                })
                .ok_or_else(|| Error::NotFound(format!("No such directory: {}", dir)))?;
        }
        Ok(current)
    }

    /// Find `name` in `dir`, either as a full file name or as a stem with
    /// one of the probed extensions. Extension order decides ties.
    fn find_in_dir(&self, dir: &Path, name: &str) -> Option<PathBuf> {
        let entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect();

        if let Some(full) = entries.iter().find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        }) {
            return Some(full.clone());
        }

        self.extensions.iter().find_map(|ext| {
            entries
                .iter()
                .find(|p| {
                    let stem_matches = p
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .is_some_and(|s| s.eq_ignore_ascii_case(name));
                    stem_matches && extension_of(p).as_deref() == Some(ext.as_str())
                })
                .cloned()
        })
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

impl FileSystem for DirFileSystem {
    fn open_read(&self, path: &str) -> Result<OpenedFile> {
        let resolved = self.resolve(path)?;
        let file = File::open(&resolved)?;
        debug!("Opened {} as {}", path, resolved.display());

        Ok(OpenedFile {
            reader: Box::new(BufReader::new(file)),
            extension: extension_of(&resolved),
            resolved,
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Audio/BGM")).unwrap();
        let mut f = File::create(dir.path().join("Audio/BGM/Town01.ogg")).unwrap();
        f.write_all(b"OggS").unwrap();
        let mut f = File::create(dir.path().join("Audio/BGM/Battle.mid")).unwrap();
        f.write_all(b"MThd").unwrap();
        dir
    }

    #[test]
    fn test_resolve_without_extension() {
        let dir = setup();
        let fs = DirFileSystem::new(dir.path());
        let resolved = fs.resolve("Audio/BGM/Town01").unwrap();
        assert!(resolved.ends_with("Town01.ogg"));
    }

    #[test]
    fn test_resolve_case_insensitive_with_backslashes() {
        let dir = setup();
        let fs = DirFileSystem::new(dir.path());
        let resolved = fs.resolve("audio\\bgm\\town01").unwrap();
        assert!(resolved.ends_with("Town01.ogg"));
    }

    #[test]
    fn test_open_read_reports_extension() {
        let dir = setup();
        let fs = DirFileSystem::new(dir.path());
        let mut opened = fs.open_read("Audio/BGM/Battle").unwrap();
        assert_eq!(opened.extension.as_deref(), Some("mid"));

        let mut magic = [0u8; 4];
        opened.reader.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, b"MThd");
    }

    #[test]
    fn test_missing_file() {
        let dir = setup();
        let fs = DirFileSystem::new(dir.path());
        assert!(!fs.exists("Audio/BGM/Nowhere"));
        assert!(matches!(fs.open_read("Audio/BGM/Nowhere"), Err(Error::NotFound(_))));
        assert!(matches!(fs.open_read("Audio/ME/Fanfare"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_empty_path_is_invalid() {
        let dir = setup();
        let fs = DirFileSystem::new(dir.path());
        assert!(matches!(fs.resolve(""), Err(Error::InvalidInput(_))));
    }
}
