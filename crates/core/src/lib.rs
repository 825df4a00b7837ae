use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub mod backend;
pub mod config;
pub mod error;
pub mod install;
pub mod mount;
pub mod oplog;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tool;

pub use backend::{BootloaderDriver, PartitionDriver, PlatformBackend};
pub use config::EngineConfig;
pub use error::{ErrorKind, MigrateError, Result};
pub use mount::MountTable;
pub use oplog::{OperationLog, OperationRecord};
pub use tool::{run_sequence, SystemToolRunner, ToolCommand, ToolOutput, ToolRunner};

/// Image container extensions accepted for migration.
pub const IMAGE_EXTENSIONS: &[&str] = &["iso", "img", "dmg", "vdi", "vmdk"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostFamily {
    Windows,
    Posix,
}

impl HostFamily {
    pub fn detect() -> Self {
        if cfg!(windows) {
            HostFamily::Windows
        } else {
            HostFamily::Posix
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostFamily::Windows => "windows",
            HostFamily::Posix => "posix",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub image_path: PathBuf,
    pub target_partition: String,
    pub preserve_data: bool,
}

impl MigrationRequest {
    pub fn new(image_path: impl Into<PathBuf>, target_partition: impl Into<String>, preserve_data: bool) -> Self {
        Self {
            image_path: image_path.into(),
            target_partition: target_partition.into(),
            preserve_data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStage {
    Idle,
    Validate,
    Backup,
    Mount,
    Partition,
    Install,
    Bootloader,
    Complete,
}

impl MigrationStage {
    /// Progress reported when the stage begins.
    pub fn progress(&self) -> u8 {
        match self {
            MigrationStage::Idle | MigrationStage::Validate | MigrationStage::Backup => 0,
            MigrationStage::Mount => 20,
            MigrationStage::Partition => 40,
            MigrationStage::Install => 60,
            MigrationStage::Bootloader => 80,
            MigrationStage::Complete => 100,
        }
    }

    pub fn failure_message(&self) -> &'static str {
        match self {
            MigrationStage::Validate => "Image validation failed",
            MigrationStage::Backup => "Backup failed",
            MigrationStage::Mount => "ISO mount failed",
            MigrationStage::Partition => "Partition preparation failed",
            MigrationStage::Install => "Installation failed",
            MigrationStage::Bootloader => "Bootloader configuration failed",
            MigrationStage::Idle | MigrationStage::Complete => "Migration failed",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStage::Idle => "idle",
            MigrationStage::Validate => "validate",
            MigrationStage::Backup => "backup",
            MigrationStage::Mount => "mount",
            MigrationStage::Partition => "partition",
            MigrationStage::Install => "install",
            MigrationStage::Bootloader => "bootloader",
            MigrationStage::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    pub run_id: Option<Uuid>,
    pub stage: MigrationStage,
    pub progress_percent: u8,
    pub last_error: Option<String>,
}

impl Default for MigrationState {
    fn default() -> Self {
        Self::idle()
    }
}

impl MigrationState {
    pub fn idle() -> Self {
        Self {
            run_id: None,
            stage: MigrationStage::Idle,
            progress_percent: 0,
            last_error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.run_id.is_some()
    }
}

/// Successful result of a single backend operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub message: String,
}

impl StageOutcome {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub source_path: PathBuf,
    pub archive_path: Option<PathBuf>,
    pub created_at_utc: String,
    pub status: BackupStatus,
    pub file_count: usize,
    pub skipped_files: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: String,
    pub disk: Option<String>,
    pub label: Option<String>,
    pub fs: Option<String>,
    pub size: Option<String>,
    pub mount_points: Vec<String>,
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootEntry {
    pub identifier: String,
    pub description: String,
    pub is_default: bool,
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn format_system_time(value: std::time::SystemTime) -> Option<String> {
    time::OffsetDateTime::from(value).format(&Rfc3339).ok()
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_progress_is_non_decreasing() {
        let stages = [
            MigrationStage::Validate,
            MigrationStage::Backup,
            MigrationStage::Mount,
            MigrationStage::Partition,
            MigrationStage::Install,
            MigrationStage::Bootloader,
            MigrationStage::Complete,
        ];
        let values: Vec<u8> = stages.iter().map(|stage| stage.progress()).collect();
        assert!(values.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(values.last(), Some(&100));
    }

    #[test]
    fn recognizes_image_extensions() {
        assert!(is_image_file(Path::new("/tmp/linux.ISO")));
        assert!(is_image_file(Path::new("disk.vmdk")));
        assert!(!is_image_file(Path::new("notes.txt")));
        assert!(!is_image_file(Path::new("noext")));
    }

    #[test]
    fn idle_state_is_inactive() {
        let state = MigrationState::idle();
        assert!(!state.is_active());
        assert_eq!(state.stage, MigrationStage::Idle);
        assert_eq!(state.progress_percent, 0);
    }
}
