//! Whole-system backup archives and the in-memory backup catalog.

use osmigrate_core::{
    now_utc_rfc3339, BackupRecord, BackupStatus, MigrateError, Result, StageOutcome, ToolCommand,
    ToolRunner,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod container;
mod store;

pub use container::{extract_archive, verify_archive, write_archive, ArchiveSummary, ArchiveVerification, Integrity};
pub use store::{delete_archive, list_archives, prune_older_than, ArchiveEntry, PruneReport};

pub const ERR_INVALID_FORMAT: &str = "Invalid backup file format";
pub const ERR_MISSING_ARCHIVE: &str = "Backup file does not exist";
pub const ERR_NO_BACKUPS: &str = "No backup files found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// Recursive copy tool used to put an extracted subtree back in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyTool {
    /// `robocopy <src> <dst> /E`; exit code 1 only means files were copied.
    Robocopy,
    /// `cp -a <src>/. <dst>`
    Cp,
}

impl CopyTool {
    pub fn command(&self, source: &Path, destination: &Path) -> ToolCommand {
        match self {
            CopyTool::Robocopy => ToolCommand::new("robocopy")
                .path_arg(source)
                .path_arg(destination)
                .arg("/E")
                .accept_codes(&[0, 1]),
            CopyTool::Cp => ToolCommand::new("cp")
                .arg("-a")
                .path_arg(&source.join("."))
                .path_arg(destination),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreStep {
    /// Top-level name inside the archive.
    pub archived_name: String,
    pub destination: PathBuf,
    pub copy: CopyTool,
}

impl RestoreStep {
    pub fn new(archived_name: impl Into<String>, destination: impl Into<PathBuf>, copy: CopyTool) -> Self {
        Self {
            archived_name: archived_name.into(),
            destination: destination.into(),
            copy,
        }
    }
}

/// What a host family considers "the system" and how it is put back.
#[derive(Debug, Clone)]
pub struct SystemProfile {
    pub format: ArchiveFormat,
    pub source_root: PathBuf,
    pub items: Vec<PathBuf>,
    pub restore_steps: Vec<RestoreStep>,
}

#[derive(Debug, Default)]
pub struct BackupCatalog {
    records: Mutex<HashMap<String, BackupRecord>>,
}

impl BackupCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, record: BackupRecord) {
        self.lock().insert(record.id.clone(), record);
    }

    /// Moves an in-progress record to its final status. Later calls are ignored.
    fn finish(&self, id: &str, status: BackupStatus, summary: ArchiveSummary) -> Option<BackupRecord> {
        let mut records = self.lock();
        let record = records.get_mut(id)?;
        if record.status != BackupStatus::InProgress {
            return Some(record.clone());
        }
        record.status = status;
        record.file_count = summary.file_count;
        record.skipped_files = summary.skipped_files;
        Some(record.clone())
    }

    pub fn get(&self, id: &str) -> Result<BackupRecord> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| MigrateError::not_found(format!("Backup {} not found", id)))
    }

    pub fn list(&self) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = self.lock().values().cloned().collect();
        records.sort_by(|left, right| {
            left.created_at_utc
                .cmp(&right.created_at_utc)
                .then_with(|| left.id.cmp(&right.id))
        });
        records
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BackupRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Archiver {
    profile: SystemProfile,
    runner: Arc<dyn ToolRunner>,
    catalog: BackupCatalog,
}

impl Archiver {
    pub fn new(profile: SystemProfile, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            profile,
            runner,
            catalog: BackupCatalog::new(),
        }
    }

    pub fn profile(&self) -> &SystemProfile {
        &self.profile
    }

    pub fn catalog(&self) -> &BackupCatalog {
        &self.catalog
    }

    pub fn create_backup(&self, destination: &Path) -> Result<BackupRecord> {
        std::fs::create_dir_all(destination)?;
        let id = new_backup_id();
        let archive_path = destination.join(format!("{}.{}", id, self.profile.format.extension()));
        self.catalog.insert(BackupRecord {
            id: id.clone(),
            source_path: self.profile.source_root.clone(),
            archive_path: Some(archive_path.clone()),
            created_at_utc: now_utc_rfc3339(),
            status: BackupStatus::InProgress,
            file_count: 0,
            skipped_files: 0,
        });
        info!(backup_id = %id, archive = %archive_path.display(), "system backup started");

        match write_archive(self.profile.format, &self.profile.items, &archive_path) {
            Ok(summary) => {
                let record = self
                    .catalog
                    .finish(&id, BackupStatus::Completed, summary)
                    .ok_or_else(|| MigrateError::not_found(format!("Backup {} not found", id)))?;
                info!(
                    backup_id = %id,
                    files = summary.file_count,
                    skipped = summary.skipped_files,
                    "system backup completed"
                );
                Ok(record)
            }
            Err(error) => {
                warn!(backup_id = %id, %error, "system backup failed");
                self.catalog.finish(&id, BackupStatus::Failed, ArchiveSummary::default());
                if let Err(cleanup) = std::fs::remove_file(&archive_path) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(archive = %archive_path.display(), error = %cleanup, "partial archive left behind");
                    }
                }
                Err(error)
            }
        }
    }

    /// Extracts into a scratch directory, then copies each archived subtree back with the
    /// profile's copy tool. The scratch directory is removed on every exit path.
    pub fn restore(&self, archive: &Path) -> Result<StageOutcome> {
        if !archive.is_file() {
            return Err(MigrateError::not_found(ERR_MISSING_ARCHIVE));
        }
        if ArchiveFormat::from_path(archive) != Some(self.profile.format) {
            return Err(MigrateError::validation(ERR_INVALID_FORMAT));
        }

        let staging = tempfile::Builder::new().prefix("_restore_").tempdir()?;
        extract_archive(self.profile.format, archive, staging.path())?;

        let mut restored = Vec::new();
        for step in &self.profile.restore_steps {
            let source = staging.path().join(&step.archived_name);
            if !source.exists() {
                debug!(item = %step.archived_name, "not present in archive, skipping");
                continue;
            }
            let command = step.copy.command(&source, &step.destination);
            self.runner
                .run(&command)
                .map_err(|error| restore_step_failed(step, error))?;
            restored.push(step.archived_name.clone());
        }

        info!(archive = %archive.display(), restored = ?restored, "system restore completed");
        Ok(StageOutcome::new(format!(
            "Restored {} from {}",
            restored.join(", "),
            archive.display()
        )))
    }

    /// Restores the newest archive of this profile's format found in `directory`.
    pub fn restore_latest(&self, directory: &Path) -> Result<StageOutcome> {
        let latest = list_archives(directory)?
            .into_iter()
            .find(|entry| entry.format == self.profile.format)
            .ok_or_else(|| MigrateError::not_found(ERR_NO_BACKUPS))?;
        self.restore(&latest.path)
    }

    pub fn get_backup_metadata(&self, id: &str) -> Result<BackupRecord> {
        self.catalog.get(id)
    }

    pub fn list_backups(&self) -> Vec<BackupRecord> {
        self.catalog.list()
    }
}

fn restore_step_failed(step: &RestoreStep, error: MigrateError) -> MigrateError {
    warn!(item = %step.archived_name, %error, "restore copy failed");
    match error {
        MigrateError::ToolExecution { program, code, stderr } => MigrateError::ToolExecution {
            program,
            code,
            stderr: format!("restore step {}: {}", step.archived_name, stderr),
        },
        other => other,
    }
}

fn new_backup_id() -> String {
    let now = time::OffsetDateTime::now_utc();
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "backup_{:04}{:02}{:02}_{:02}{:02}{:02}_{}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        &suffix[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmigrate_core::testing::ScriptedRunner;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        backups: PathBuf,
        runner: Arc<ScriptedRunner>,
        archiver: Archiver,
    }

    fn fixture(format: ArchiveFormat) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("system");
        fs::create_dir_all(root.join("etc/network")).unwrap();
        fs::write(root.join("etc/hostname"), b"box").unwrap();
        fs::write(root.join("etc/network/interfaces"), b"auto lo").unwrap();
        fs::create_dir_all(root.join("boot")).unwrap();
        fs::write(root.join("boot/vmlinuz"), b"kernel").unwrap();

        let profile = SystemProfile {
            format,
            source_root: root.clone(),
            items: vec![root.join("etc"), root.join("boot"), root.join("home")],
            restore_steps: vec![
                RestoreStep::new("etc", root.join("etc"), CopyTool::Cp),
                RestoreStep::new("boot", root.join("boot"), CopyTool::Cp),
                RestoreStep::new("home", root.join("home"), CopyTool::Cp),
            ],
        };
        let runner = Arc::new(ScriptedRunner::new());
        let archiver = Archiver::new(profile, runner.clone());
        Fixture {
            backups: dir.path().join("backups"),
            _dir: dir,
            root,
            runner,
            archiver,
        }
    }

    #[test]
    fn backup_round_trip_matches_file_count() {
        let fx = fixture(ArchiveFormat::Zip);
        let record = fx.archiver.create_backup(&fx.backups).unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.file_count, 3);
        assert!(record.id.starts_with("backup_"));

        let listed = list_archives(&fx.backups).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(Some(&listed[0].path), record.archive_path.as_ref());

        let verification = verify_archive(&listed[0].path).unwrap();
        assert_eq!(verification.file_count, 3);
        assert_eq!(verification.integrity, Integrity::Good);
    }

    #[test]
    fn catalog_tracks_records() {
        let fx = fixture(ArchiveFormat::TarGz);
        let first = fx.archiver.create_backup(&fx.backups).unwrap();
        let fetched = fx.archiver.get_backup_metadata(&first.id).unwrap();
        assert_eq!(fetched, first);
        assert_eq!(fx.archiver.list_backups().len(), 1);
        assert!(matches!(
            fx.archiver.get_backup_metadata("backup_missing"),
            Err(MigrateError::NotFound(_))
        ));
    }

    #[test]
    fn failed_backup_is_recorded_once() {
        let fx = fixture(ArchiveFormat::Zip);
        let blocked = fx.backups.clone();
        fs::write(&blocked, b"not a directory").unwrap();
        assert!(fx.archiver.create_backup(&blocked).is_err());
        assert!(fx.archiver.list_backups().is_empty());

        let catalog = BackupCatalog::new();
        catalog.insert(BackupRecord {
            id: "b1".to_string(),
            source_path: PathBuf::from("/"),
            archive_path: None,
            created_at_utc: now_utc_rfc3339(),
            status: BackupStatus::InProgress,
            file_count: 0,
            skipped_files: 0,
        });
        catalog.finish("b1", BackupStatus::Failed, ArchiveSummary::default());
        let after = catalog.finish("b1", BackupStatus::Completed, ArchiveSummary { file_count: 9, skipped_files: 0 });
        assert_eq!(after.map(|record| record.status), Some(BackupStatus::Failed));
    }

    #[test]
    fn restore_copies_archived_subtrees() {
        let fx = fixture(ArchiveFormat::TarGz);
        let record = fx.archiver.create_backup(&fx.backups).unwrap();
        let archive = record.archive_path.unwrap();

        let outcome = fx.archiver.restore(&archive).unwrap();
        assert!(outcome.message.contains("etc, boot"));

        let calls = fx.runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].program, "cp");
        assert_eq!(calls[0].args[0], "-a");
        assert!(calls[0].args[1].ends_with("etc/."));
        assert_eq!(calls[0].args[2], fx.root.join("etc").to_string_lossy());
        let staging = PathBuf::from(&calls[0].args[1]);
        assert!(!staging.exists());
    }

    #[test]
    fn restore_names_failing_step() {
        let fx = fixture(ArchiveFormat::Zip);
        let archive = fx.archiver.create_backup(&fx.backups).unwrap().archive_path.unwrap();
        fx.runner.fail("cp", Some("boot"));

        match fx.archiver.restore(&archive) {
            Err(MigrateError::ToolExecution { stderr, .. }) => {
                assert!(stderr.starts_with("restore step boot:"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(fx.runner.calls().len(), 2);
    }

    #[test]
    fn restore_rejects_other_format() {
        let fx = fixture(ArchiveFormat::Zip);
        fs::create_dir_all(&fx.backups).unwrap();
        let archive = fx.backups.join("backup.tar.gz");
        fs::write(&archive, b"").unwrap();
        match fx.archiver.restore(&archive) {
            Err(MigrateError::Validation(message)) => assert_eq!(message, ERR_INVALID_FORMAT),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn restore_latest_without_archives_is_not_found() {
        let fx = fixture(ArchiveFormat::TarGz);
        assert!(matches!(
            fx.archiver.restore_latest(&fx.backups),
            Err(MigrateError::NotFound(_))
        ));
    }

    #[test]
    fn robocopy_accepts_benign_exit_code() {
        let command = CopyTool::Robocopy.command(Path::new("C:\\tmp\\Users"), Path::new("C:\\Users"));
        assert_eq!(command.args, vec!["C:\\tmp\\Users", "C:\\Users", "/E"]);
        assert!(command.is_accepted(Some(1)));
        assert!(!command.is_accepted(Some(2)));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ArchiveFormat::from_path(Path::new("a/backup_1.ZIP")), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_path(Path::new("backup_1.tar.gz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_path(Path::new("backup_1.tar")), None);
    }
}
