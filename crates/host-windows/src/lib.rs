//! Windows-family backend: `Mount-DiskImage` mounts, Storage-module partitioning,
//! `bcdedit` boot entries and zip system backups restored with Robocopy.

use osmigrate_archive::{ArchiveFormat, Archiver, CopyTool, RestoreStep, SystemProfile};
use osmigrate_core::install::find_installer;
use osmigrate_core::mount::release_mount_point;
use osmigrate_core::{
    BackupRecord, BootloaderDriver, EngineConfig, HostFamily, MigrateError, MountTable,
    PartitionDriver, PlatformBackend, Result, StageOutcome, ToolCommand, ToolRunner,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub mod bootloader;
pub mod partition;

pub use bootloader::BcdDriver;
pub use partition::{parse_drive_letter, system_drive, WindowsPartitionDriver};

/// Trees archived by a system backup, relative to the system drive root.
pub const BACKUP_ITEMS: [&str; 5] = [
    "Windows\\System32\\config",
    "Windows\\Boot",
    "Windows\\System32\\drivers",
    "ProgramData\\Microsoft\\Windows\\Start Menu",
    "Users",
];

/// Archived subtree name and where Robocopy puts it back.
pub const RESTORE_ITEMS: [(&str, &str); 3] = [
    ("config", "Windows\\System32\\config"),
    ("Boot", "Windows\\Boot"),
    ("Users", "Users"),
];

/// Wraps a script in a non-interactive PowerShell invocation.
pub fn powershell(script: impl Into<String>) -> ToolCommand {
    ToolCommand::new("powershell")
        .args([
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
        ])
        .arg(script)
}

/// PowerShell single-quoted literal; embedded quotes are doubled.
pub fn ps_quote_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn ps_quote(path: &Path) -> String {
    ps_quote_str(&path.to_string_lossy())
}

fn under_root(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('\\')
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

pub fn system_profile(root: &Path) -> SystemProfile {
    SystemProfile {
        format: ArchiveFormat::Zip,
        source_root: root.to_path_buf(),
        items: BACKUP_ITEMS.iter().map(|item| under_root(root, item)).collect(),
        restore_steps: RESTORE_ITEMS
            .iter()
            .map(|(name, destination)| {
                RestoreStep::new(*name, under_root(root, destination), CopyTool::Robocopy)
            })
            .collect(),
    }
}

pub struct WindowsBackend {
    runner: Arc<dyn ToolRunner>,
    mounts: MountTable,
    partitions: WindowsPartitionDriver,
    bootloader: BcdDriver,
    archiver: Archiver,
}

impl WindowsBackend {
    pub fn new(config: &EngineConfig, runner: Arc<dyn ToolRunner>) -> Result<Self> {
        let drive = system_drive();
        let root = PathBuf::from(format!("{}:\\", drive));
        Ok(Self {
            mounts: MountTable::new(config.work_dir.as_deref())?,
            partitions: WindowsPartitionDriver::new(runner.clone(), drive),
            bootloader: BcdDriver::new(runner.clone(), config.boot_entry_title.clone()),
            archiver: Archiver::new(system_profile(&root), runner.clone()),
            runner,
        })
    }

    /// Backs up and restores relative to `root` instead of the system drive.
    pub fn with_system_root(mut self, root: &Path) -> Self {
        self.archiver = Archiver::new(system_profile(root), self.runner.clone());
        self
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    fn dismount_command(image: &Path) -> ToolCommand {
        powershell(format!("Dismount-DiskImage -ImagePath {}", ps_quote(image)))
    }

    fn dismount_after_failure(&self, image: &Path) {
        if let Err(cleanup) = self.runner.run(&Self::dismount_command(image)) {
            warn!(image = %image.display(), error = %cleanup, "image left attached");
        }
    }
}

impl PlatformBackend for WindowsBackend {
    fn family(&self) -> HostFamily {
        HostFamily::Windows
    }

    fn partitions(&self) -> &dyn PartitionDriver {
        &self.partitions
    }

    fn bootloader(&self) -> &dyn BootloaderDriver {
        &self.bootloader
    }

    fn install_from_mount(&self, mount_point: &Path, partition_id: &str) -> Result<StageOutcome> {
        let target = format!("{}:", parse_drive_letter(partition_id)?);
        let installer = find_installer(mount_point)
            .ok_or_else(|| MigrateError::not_found("No installation script found"))?;
        info!(installer = %installer.display(), target = %target, "running installer");
        self.runner.run(
            &ToolCommand::new(installer.to_string_lossy().to_string())
                .arg("/s")
                .arg(format!("/t:{}", target)),
        )?;
        Ok(StageOutcome::new(format!(
            "Installed from {} onto {}",
            installer.display(),
            target
        )))
    }

    fn mount_image(&self, image: &Path) -> Result<PathBuf> {
        if !image.is_file() {
            return Err(MigrateError::not_found(format!("Image {} not found", image.display())));
        }
        if let Some(existing) = self.mounts.get(image) {
            return Err(MigrateError::Mount(format!(
                "{} is already mounted at {}",
                image.display(),
                existing.display()
            )));
        }

        let mount_point = self.mounts.allocate()?;
        let script = format!(
            "Mount-DiskImage -ImagePath {} -PassThru | Get-Volume | Get-Partition | \
             Add-PartitionAccessPath -AccessPath {}",
            ps_quote(image),
            ps_quote(&mount_point)
        );
        if let Err(error) = self.runner.run(&powershell(script)) {
            // The image may be attached even though the access path was not added.
            self.dismount_after_failure(image);
            if let Err(cleanup) = release_mount_point(&mount_point) {
                warn!(mount_point = %mount_point.display(), error = %cleanup, "mount point left behind");
            }
            return Err(error);
        }
        if let Err(error) = self.mounts.insert(image, mount_point.clone()) {
            self.dismount_after_failure(image);
            return Err(error);
        }
        info!(image = %image.display(), mount_point = %mount_point.display(), "image mounted");
        Ok(mount_point)
    }

    fn unmount_image(&self, image: &Path) -> Result<()> {
        let mount_point = self
            .mounts
            .get(image)
            .ok_or_else(|| MigrateError::NotMounted(image.to_path_buf()))?;
        self.runner.run(&Self::dismount_command(image))?;
        self.mounts.remove(image);
        release_mount_point(&mount_point)?;
        info!(image = %image.display(), "image unmounted");
        Ok(())
    }

    fn create_archive(&self, destination: &Path) -> Result<BackupRecord> {
        self.archiver.create_backup(destination)
    }

    fn restore_archive(&self, archive: &Path) -> Result<StageOutcome> {
        self.archiver.restore(archive)
    }

    fn restore_latest(&self, directory: &Path) -> Result<StageOutcome> {
        self.archiver.restore_latest(directory)
    }
}

impl Drop for WindowsBackend {
    fn drop(&mut self) {
        for (image, mount_point) in self.mounts.snapshot() {
            warn!(image = %image.display(), "dismounting image left mounted");
            match self.runner.run(&Self::dismount_command(&image)) {
                Ok(_) => {
                    self.mounts.remove(&image);
                    if let Err(error) = release_mount_point(&mount_point) {
                        warn!(%error, "failed to remove mount point");
                    }
                }
                Err(error) => warn!(%error, "forced dismount failed"),
            }
        }
    }
}
