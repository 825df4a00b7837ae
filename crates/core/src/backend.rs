//! Capability contract implemented once per host family.

use crate::error::Result;
use crate::oplog::OperationRecord;
use crate::{BackupRecord, BootEntry, HostFamily, PartitionInfo, StageOutcome};
use std::path::{Path, PathBuf};

/// Partition-table and filesystem operations, delegated to host tools.
pub trait PartitionDriver: Send + Sync {
    /// Checks that `partition_id` names an existing partition this backend may target.
    fn validate(&self, partition_id: &str) -> Result<()>;

    /// Marks the partition ready and creates a fresh filesystem on it. Destroys existing data.
    fn prepare(&self, partition_id: &str) -> Result<StageOutcome>;

    fn list(&self) -> Result<Vec<PartitionInfo>>;

    fn info(&self, partition_id: &str) -> Result<PartitionInfo>;

    /// `size` of `None` uses the remaining free space on `disk`.
    fn create(&self, disk: &str, size: Option<&str>, fs: &str) -> Result<StageOutcome>;

    fn delete(&self, partition_id: &str) -> Result<StageOutcome>;

    fn resize(&self, partition_id: &str, size: &str) -> Result<StageOutcome>;

    fn format(&self, partition_id: &str, fs: &str, label: Option<&str>) -> Result<StageOutcome>;

    fn operation_log(&self) -> Vec<OperationRecord>;
}

pub trait BootloaderDriver: Send + Sync {
    /// Adds a boot entry for the system installed on `partition_id` and refreshes
    /// the platform boot configuration.
    fn configure(&self, partition_id: &str) -> Result<StageOutcome>;

    fn list_entries(&self) -> Result<Vec<BootEntry>>;

    fn set_default(&self, entry: &str) -> Result<StageOutcome>;

    fn remove_entry(&self, entry: &str) -> Result<StageOutcome>;
}

/// One implementation is bound per process, selected from the host family at startup.
///
/// Every operation reports failure through [`crate::MigrateError`]; implementations
/// never panic on tool or filesystem errors.
pub trait PlatformBackend: Send + Sync {
    fn family(&self) -> HostFamily;

    fn partitions(&self) -> &dyn PartitionDriver;

    fn bootloader(&self) -> &dyn BootloaderDriver;

    fn validate_partition(&self, partition_id: &str) -> Result<()> {
        self.partitions().validate(partition_id)
    }

    fn prepare_partition(&self, partition_id: &str) -> Result<StageOutcome> {
        self.partitions().prepare(partition_id)
    }

    fn install_from_mount(&self, mount_point: &Path, partition_id: &str) -> Result<StageOutcome>;

    fn configure_bootloader(&self, partition_id: &str) -> Result<StageOutcome> {
        self.bootloader().configure(partition_id)
    }

    fn mount_image(&self, image: &Path) -> Result<PathBuf>;

    fn unmount_image(&self, image: &Path) -> Result<()>;

    fn create_archive(&self, destination: &Path) -> Result<BackupRecord>;

    fn restore_archive(&self, archive: &Path) -> Result<StageOutcome>;

    /// Restores the newest archive of this backend's format found in `directory`.
    fn restore_latest(&self, directory: &Path) -> Result<StageOutcome>;
}
