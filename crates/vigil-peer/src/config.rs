use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use vigil_core::state::StoredConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

/// File-backed persistence for the minimal re-hydration schema: tracked
/// entities, cursors, settings. Saved after every accepted mutation so a
/// restarted peer resumes where it left off.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$XDG_CONFIG_HOME/vigil/state.json` (or the platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vigil").join("state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty config, not an error; a corrupt file is.
    pub fn load(&self) -> Result<StoredConfig, ConfigError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StoredConfig::default())
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Write-then-rename so a crash mid-save never truncates the config.
    pub fn save(&self, config: &StoredConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(config)
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
