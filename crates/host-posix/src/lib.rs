//! POSIX-family backend: loop mounts, `lsblk`/`parted`/`mkfs` partitioning, GRUB and
//! tar.gz system backups.

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

pub use bootloader::GrubDriver;
pub use partition::PosixPartitionDriver;

/// Top-level trees archived by a system backup, relative to the system root.
pub const BACKUP_ITEMS: [&str; 5] = ["etc", "boot", "home", "var/log", "usr/local"];

/// Archived subtrees copied back on restore.
pub const RESTORE_ITEMS: [&str; 3] = ["etc", "boot", "home"];

pub fn system_profile(root: &Path) -> SystemProfile {
    SystemProfile {
        format: ArchiveFormat::TarGz,
        source_root: root.to_path_buf(),
        items: BACKUP_ITEMS.iter().map(|item| root.join(item)).collect(),
        restore_steps: RESTORE_ITEMS
            .iter()
            .map(|item| RestoreStep::new(*item, root.join(item), CopyTool::Cp))
            .collect(),
    }
}

pub struct PosixBackend {
    runner: Arc<dyn ToolRunner>,
    mounts: MountTable,
    partitions: PosixPartitionDriver,
    bootloader: GrubDriver,
    archiver: Archiver,
}

impl PosixBackend {
    pub fn new(config: &EngineConfig, runner: Arc<dyn ToolRunner>) -> Result<Self> {
        let mounts = MountTable::new(config.work_dir.as_deref())?;
        Ok(Self {
            partitions: PosixPartitionDriver::new(runner.clone(), config.install_mount.clone()),
            bootloader: GrubDriver::new(
                runner.clone(),
                config.grub_dir.clone(),
                config.grub_default_file.clone(),
                config.boot_entry_title.clone(),
            ),
            archiver: Archiver::new(system_profile(Path::new("/")), runner.clone()),
            mounts,
            runner,
        })
    }

    /// Backs up and restores relative to `root` instead of `/`.
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
}

impl PlatformBackend for PosixBackend {
    fn family(&self) -> HostFamily {
        HostFamily::Posix
    }

    fn partitions(&self) -> &dyn PartitionDriver {
        &self.partitions
    }

    fn bootloader(&self) -> &dyn BootloaderDriver {
        &self.bootloader
    }

    fn install_from_mount(&self, mount_point: &Path, partition_id: &str) -> Result<StageOutcome> {
        let installer = find_installer(mount_point)
            .ok_or_else(|| MigrateError::not_found("No installation script found"))?;
        info!(installer = %installer.display(), target = partition_id, "running installer");
        self.runner
            .run(&ToolCommand::new("bash").path_arg(&installer).arg(partition_id))?;
        Ok(StageOutcome::new(format!(
            "Installed from {} onto {}",
            installer.display(),
            partition_id
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
        let command = ToolCommand::new("mount")
            .args(["-o", "loop,ro"])
            .path_arg(image)
            .path_arg(&mount_point);
        if let Err(error) = self.runner.run(&command) {
            if let Err(cleanup) = release_mount_point(&mount_point) {
                warn!(mount_point = %mount_point.display(), error = %cleanup, "mount point left behind");
            }
            return Err(error);
        }
        if let Err(error) = self.mounts.insert(image, mount_point.clone()) {
            if let Err(cleanup) = self.runner.run(&ToolCommand::new("umount").path_arg(&mount_point)) {
                warn!(mount_point = %mount_point.display(), error = %cleanup, "image left mounted");
            }
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
        self.runner
            .run(&ToolCommand::new("umount").path_arg(&mount_point))?;
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

impl Drop for PosixBackend {
    fn drop(&mut self) {
        for (image, mount_point) in self.mounts.snapshot() {
            warn!(image = %image.display(), "force-unmounting image left mounted");
            let command = ToolCommand::new("umount").arg("-l").path_arg(&mount_point);
            match self.runner.run(&command) {
                Ok(_) => {
                    self.mounts.remove(&image);
                    if let Err(error) = release_mount_point(&mount_point) {
                        warn!(%error, "failed to remove mount point");
                    }
                }
                Err(error) => warn!(%error, "forced unmount failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmigrate_core::testing::ScriptedRunner;
    use std::fs;

    fn backend(runner: &Arc<ScriptedRunner>, work: &Path) -> PosixBackend {
        let config = EngineConfig {
            work_dir: Some(work.to_path_buf()),
            install_mount: work.join("install"),
            grub_dir: work.join("grub.d"),
            grub_default_file: work.join("grub"),
            ..EngineConfig::default()
        };
        PosixBackend::new(&config, runner.clone()).unwrap()
    }

    fn image(dir: &Path) -> PathBuf {
        let path = dir.join("linux.iso");
        fs::write(&path, b"iso").unwrap();
        path
    }

    #[test]
    fn mount_then_unmount_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(&runner, dir.path());
        let image = image(dir.path());

        let mount_point = backend.mount_image(&image).unwrap();
        assert!(mount_point.is_dir());
        assert_eq!(backend.mounts().get(&image), Some(mount_point.clone()));

        backend.unmount_image(&image).unwrap();
        assert!(!backend.mounts().contains(&image));
        assert!(!mount_point.exists());
        assert_eq!(
            runner.command_lines(),
            vec![
                format!("mount -o loop,ro {} {}", image.display(), mount_point.display()),
                format!("umount {}", mount_point.display()),
            ]
        );
    }

    #[test]
    fn unmount_of_unknown_image_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(&runner, dir.path());
        assert!(matches!(
            backend.unmount_image(Path::new("/images/never.iso")),
            Err(MigrateError::NotMounted(_))
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn failed_mount_releases_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("mount", None);
        let backend = backend(&runner, dir.path());

        assert!(backend.mount_image(&image(dir.path())).is_err());
        assert!(backend.mounts().is_empty());
        assert_eq!(fs::read_dir(backend.mounts().root()).unwrap().count(), 0);
    }

    #[test]
    fn double_mount_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(&runner, dir.path());
        let image = image(dir.path());
        backend.mount_image(&image).unwrap();
        assert!(matches!(backend.mount_image(&image), Err(MigrateError::Mount(_))));
        assert_eq!(backend.mounts().len(), 1);
    }

    #[test]
    fn drop_force_unmounts_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let image = image(dir.path());
        let mount_point = {
            let backend = backend(&runner, dir.path());
            backend.mount_image(&image).unwrap()
        };
        assert!(!mount_point.exists());
        let last = runner.command_lines().pop().unwrap();
        assert_eq!(last, format!("umount -l {}", mount_point.display()));
    }

    #[test]
    fn install_runs_first_candidate_with_target() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(&runner, dir.path());
        let tree = dir.path().join("tree");
        fs::create_dir(&tree).unwrap();
        fs::write(tree.join("install.sh"), b"#!/bin/sh\n").unwrap();
        fs::write(tree.join("installer"), b"").unwrap();

        backend.install_from_mount(&tree, "/dev/sdb1").unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![format!("bash {} /dev/sdb1", tree.join("install.sh").display())]
        );
    }

    #[test]
    fn install_without_entry_point_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(&runner, dir.path());
        match backend.install_from_mount(dir.path(), "/dev/sdb1") {
            Err(MigrateError::NotFound(message)) => assert_eq!(message, "No installation script found"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn backup_covers_existing_system_trees() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/fstab"), b"# fstab").unwrap();
        fs::create_dir_all(root.join("var/log")).unwrap();
        fs::write(root.join("var/log/syslog"), b"boot ok").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(&runner, dir.path()).with_system_root(&root);
        let record = backend.create_archive(&dir.path().join("backups")).unwrap();
        assert_eq!(record.file_count, 2);
        let archive = record.archive_path.unwrap();
        assert!(archive.to_string_lossy().ends_with(".tar.gz"));

        backend.restore_archive(&archive).unwrap();
        assert_eq!(runner.programs(), vec!["cp"]);
    }
}
