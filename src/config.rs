//! `inox.toml`: folder layout and build defaults.
//!
//! ```toml
//! [directories]
//! hardware = ["/opt/arduino/hardware"]
//! tools = ["/opt/arduino/tools"]
//! libraries = ["~/Arduino/libraries"]
//!
//! [build]
//! fqbn = "arduino:avr:uno"
//! jobs = 4
//! warnings = "default"
//! properties = ["build.extra_flags=-DDEBUG"]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "inox.toml";

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct InoxConfig {
    pub directories: DirectoriesConfig,
    pub build: BuildConfig,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct DirectoriesConfig {
    pub hardware: Vec<PathBuf>,
    pub tools: Vec<PathBuf>,
    pub libraries: Vec<PathBuf>,
    pub builtin_libraries: Vec<PathBuf>,
    /// Core cache root; the user cache folder when unset.
    pub cache: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    pub fqbn: Option<String>,
    pub jobs: Option<usize>,
    pub warnings: Option<String>,
    pub verbose: bool,
    pub properties: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// Read `explicit`, or `inox.toml` from the current folder when it exists.
/// No file at all gives the defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<InoxConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(CONFIG_FILE);
            if !default.is_file() {
                return Ok(InoxConfig::default());
            }
            default
        }
    };
    let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "[directories]\nhardware = [\"/hw\"]\n\n[build]\nfqbn = \"arduino:avr:uno\"\njobs = 2\nproperties = [\"a=b\"]\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.directories.hardware, vec![PathBuf::from("/hw")]);
        assert!(config.directories.tools.is_empty());
        assert_eq!(config.build.fqbn.as_deref(), Some("arduino:avr:uno"));
        assert_eq!(config.build.jobs, Some(2));
        assert_eq!(config.build.properties, vec!["a=b"]);
        assert!(!config.build.verbose);
    }

    #[test]
    fn test_invalid_and_missing_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        fs::write(&path, "[build]\njobs = \"many\"\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
        assert!(load_config(Some(&tmp.path().join("nope.toml"))).is_err());
    }
}
