//! Engine configuration: JSON file with environment overrides.

use crate::error::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_BACKUP_DIR: &str = "OSMIGRATE_BACKUP_DIR";
pub const ENV_WORK_DIR: &str = "OSMIGRATE_WORK_DIR";
pub const ENV_TOOL_TIMEOUT_SECS: &str = "OSMIGRATE_TOOL_TIMEOUT_SECS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory receiving backup archives and scanned by archive listing.
    pub backup_dir: PathBuf,

    /// Parent of the per-process mount-point root. `None` uses the system temp dir.
    pub work_dir: Option<PathBuf>,

    /// Upper bound for any single external tool invocation. Zero disables the limit.
    pub tool_timeout_secs: u64,

    pub retention_days: u32,

    pub boot_entry_title: String,

    pub grub_dir: PathBuf,

    pub grub_default_file: PathBuf,

    /// Where the POSIX backend mounts the freshly formatted target partition.
    pub install_mount: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_dir: std::env::temp_dir().join("osmigrate_backups"),
            work_dir: None,
            tool_timeout_secs: 3600,
            retention_days: 30,
            boot_entry_title: "Migrated OS".to_string(),
            grub_dir: PathBuf::from("/etc/grub.d"),
            grub_default_file: PathBuf::from("/etc/default/grub"),
            install_mount: PathBuf::from("/mnt/osmigrate_install"),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&data)
            .map_err(|error| MigrateError::Parse(format!("{}: {}", path.display(), error)))?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise defaults, then applies environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(ENV_BACKUP_DIR) {
            self.backup_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var(ENV_WORK_DIR) {
            self.work_dir = Some(PathBuf::from(value));
        }
        if let Ok(value) = std::env::var(ENV_TOOL_TIMEOUT_SECS) {
            self.tool_timeout_secs = value.trim().parse::<u64>().map_err(|_| {
                MigrateError::validation(format!("{} must be a number of seconds", ENV_TOOL_TIMEOUT_SECS))
            })?;
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        if self.tool_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.tool_timeout_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "retention_days": 7, "boot_entry_title": "Fresh" }"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.boot_entry_title, "Fresh");
        assert_eq!(config.tool_timeout_secs, 3600);
        assert_eq!(config.grub_dir, PathBuf::from("/etc/grub.d"));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(MigrateError::Parse(_))));
    }

    #[test]
    fn zero_timeout_disables_limit() {
        let config = EngineConfig {
            tool_timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.tool_timeout(), None);
    }
}
