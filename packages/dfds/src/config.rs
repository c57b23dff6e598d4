use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DfdsError, Result};

/// Name of the configuration file searched in the home and working directories
pub const CONFIG_FILE_NAME: &str = ".streaminghubrc";

/// Resolved StreamingHub configuration
///
/// Both directories are expanded and checked to exist at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root of the recorded collections (`<data_dir>/<collection>/...`)
    pub data_dir: PathBuf,
    /// Directory holding `*.collection.json` descriptors
    pub meta_dir: PathBuf,
}

/// A configuration layer in which every key may be absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_dir: Option<String>,
}

impl PartialConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DfdsError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| DfdsError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Overlay `other` on top of `self`; keys present in `other` win.
    pub fn merge(self, other: PartialConfig) -> PartialConfig {
        PartialConfig {
            data_dir: other.data_dir.or(self.data_dir),
            meta_dir: other.meta_dir.or(self.meta_dir),
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn existing_dir(key: &str, value: Option<String>) -> Result<PathBuf> {
    let value = value.ok_or_else(|| DfdsError::Config(format!("missing '{}'", key)))?;
    let path = expand_home(&value);
    if !path.is_dir() {
        return Err(DfdsError::Config(format!(
            "{} is not an existing directory: {}",
            key,
            path.display()
        )));
    }
    Ok(path.canonicalize().unwrap_or(path))
}

impl Config {
    pub fn new(data_dir: impl AsRef<str>, meta_dir: impl AsRef<str>) -> Result<Self> {
        Self::from_partial(PartialConfig {
            data_dir: Some(data_dir.as_ref().to_string()),
            meta_dir: Some(meta_dir.as_ref().to_string()),
        })
    }

    pub fn from_partial(partial: PartialConfig) -> Result<Self> {
        Ok(Self {
            data_dir: existing_dir("data_dir", partial.data_dir)?,
            meta_dir: existing_dir("meta_dir", partial.meta_dir)?,
        })
    }

    /// `~/.streaminghubrc`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
    }

    /// Config files in precedence order (later entries override earlier ones)
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = Self::default_path() {
            paths.push(home);
        }
        paths.push(PathBuf::from(CONFIG_FILE_NAME));
        paths
    }

    /// Load from the standard search paths with `overrides` applied last.
    pub fn load_with(overrides: PartialConfig) -> Result<Self> {
        Self::load_from(&Self::search_paths(), overrides)
    }

    pub fn load() -> Result<Self> {
        Self::load_with(PartialConfig::default())
    }

    pub fn load_from(paths: &[PathBuf], overrides: PartialConfig) -> Result<Self> {
        let mut merged = PartialConfig::default();
        for path in paths {
            if path.is_file() {
                tracing::debug!("Reading config: {}", path.display());
                merged = merged.merge(PartialConfig::from_file(path)?);
            }
        }
        Self::from_partial(merged.merge(overrides))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        tracing::info!("Updated {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_directory_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = Config::new(dir.path().to_str().unwrap(), missing.to_str().unwrap());
        assert!(matches!(err, Err(DfdsError::Config(_))));
    }

    #[test]
    fn test_layered_load() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let meta = dir.path().join("meta");
        let other = dir.path().join("other");
        for d in [&data, &meta, &other] {
            std::fs::create_dir(d).unwrap();
        }

        let home_rc = dir.path().join("home.rc");
        std::fs::write(
            &home_rc,
            format!(
                r#"{{"data_dir": "{}", "meta_dir": "{}"}}"#,
                data.display(),
                meta.display()
            ),
        )
        .unwrap();
        let local_rc = dir.path().join("local.rc");
        std::fs::write(&local_rc, format!(r#"{{"meta_dir": "{}"}}"#, other.display())).unwrap();

        let config = Config::load_from(
            &[home_rc.clone(), local_rc.clone(), dir.path().join("absent.rc")],
            PartialConfig::default(),
        )
        .unwrap();
        assert_eq!(config.data_dir, data.canonicalize().unwrap());
        assert_eq!(config.meta_dir, other.canonicalize().unwrap());

        let overridden = Config::load_from(
            &[home_rc],
            PartialConfig {
                data_dir: Some(other.display().to_string()),
                meta_dir: None,
            },
        )
        .unwrap();
        assert_eq!(overridden.data_dir, other.canonicalize().unwrap());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(
            dir.path().to_str().unwrap(),
            dir.path().to_str().unwrap(),
        )
        .unwrap();
        let rc = dir.path().join(CONFIG_FILE_NAME);
        config.save(&rc).unwrap();
        let loaded = Config::load_from(&[rc], PartialConfig::default()).unwrap();
        assert_eq!(loaded, config);
    }
}
