//! Configuration file resolution and loading
//!
//! Config files are located following a fixed priority order:
//! 1. Explicit path (command-line argument, highest priority)
//! 2. Environment variable
//! 3. Platform config directory (`<config_dir>/rgss/<file_name>`)
//! 4. None: caller falls back to compiled defaults

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory name under the platform config dir
const CONFIG_DIR_NAME: &str = "rgss";

/// Resolve the config file to load.
///
/// Returns `None` when no candidate exists; missing configuration is never
/// an error, the subsystem simply runs with its defaults.
pub fn resolve_config_file(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    let candidate = dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(file_name))?;
    if candidate.is_file() {
        Some(candidate)
    } else {
        debug!("No config file at {}", candidate.display());
        None
    }
}

/// Parse a TOML document into `T`.
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
}

/// Load and parse a TOML config file.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_toml(&content)
}

/// Resolve and load a config file, falling back to `T::default()`.
///
/// An explicitly requested file that fails to load is an error; an
/// implicitly discovered one that fails to load only warns.
pub fn load_or_default<T: DeserializeOwned + Default>(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> Result<T> {
    match resolve_config_file(cli_arg, env_var_name, file_name) {
        Some(path) if cli_arg.is_some() => load_toml(&path),
        Some(path) => match load_toml(&path) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Ignoring config file {}: {}", path.display(), e);
                Ok(T::default())
            }
        },
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        volume: f32,
        name: String,
    }

    #[test]
    fn test_parse_toml() {
        let parsed: Sample = parse_toml("volume = 0.5\nname = \"bgm\"").unwrap();
        assert_eq!(parsed.volume, 0.5);
        assert_eq!(parsed.name, "bgm");
    }

    #[test]
    fn test_parse_toml_invalid() {
        let result: Result<Sample> = parse_toml("volume = = 1");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_cli_arg_wins_over_env() {
        std::env::set_var("RGSS_TEST_CONFIG", "/from/env.toml");
        let resolved = resolve_config_file(
            Some(Path::new("/from/cli.toml")),
            "RGSS_TEST_CONFIG",
            "test.toml",
        );
        assert_eq!(resolved, Some(PathBuf::from("/from/cli.toml")));
        std::env::remove_var("RGSS_TEST_CONFIG");
    }

    #[test]
    #[serial]
    fn test_env_var_used_without_cli_arg() {
        std::env::set_var("RGSS_TEST_CONFIG", "/from/env.toml");
        let resolved = resolve_config_file(None, "RGSS_TEST_CONFIG", "test.toml");
        assert_eq!(resolved, Some(PathBuf::from("/from/env.toml")));
        std::env::remove_var("RGSS_TEST_CONFIG");
    }

    #[test]
    #[serial]
    fn test_load_or_default_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "volume = 0.25").unwrap();

        let loaded: Sample =
            load_or_default(Some(file.path()), "RGSS_TEST_CONFIG_UNSET", "test.toml").unwrap();
        assert_eq!(loaded.volume, 0.25);
        assert_eq!(loaded.name, "");
    }

    #[test]
    #[serial]
    fn test_load_or_default_missing_explicit_file_is_error() {
        let result: Result<Sample> = load_or_default(
            Some(Path::new("/nonexistent/rgss/audio.toml")),
            "RGSS_TEST_CONFIG_UNSET",
            "test.toml",
        );
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_load_or_default_bad_env_file_warns_and_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "volume = \"loud\"").unwrap();
        std::env::set_var("RGSS_TEST_CONFIG", file.path());

        let loaded: Sample = load_or_default(None, "RGSS_TEST_CONFIG", "test.toml").unwrap();
        assert_eq!(loaded, Sample::default());
        std::env::remove_var("RGSS_TEST_CONFIG");
    }
}
