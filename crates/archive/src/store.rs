//! Filesystem-level operations over a directory of backup archives.

use crate::{ArchiveFormat, ERR_INVALID_FORMAT, ERR_MISSING_ARCHIVE};
use osmigrate_core::{format_system_time, MigrateError, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub path: PathBuf,
    pub format: ArchiveFormat,
    pub size_bytes: u64,
    pub created_utc: Option<String>,
    pub modified_utc: Option<String>,
    #[serde(skip)]
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl PruneReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Archives directly inside `directory`, newest first. A missing directory lists nothing.
pub fn list_archives(directory: impl AsRef<Path>) -> Result<Vec<ArchiveEntry>> {
    let directory = directory.as_ref();
    if !directory.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        let Some(format) = ArchiveFormat::from_path(&path) else {
            continue;
        };
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified()?;
        entries.push(ArchiveEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            path,
            format,
            size_bytes: metadata.len(),
            created_utc: metadata.created().ok().and_then(format_system_time),
            modified_utc: format_system_time(modified),
            modified,
        });
    }
    entries.sort_by(|left, right| right.modified.cmp(&left.modified));
    Ok(entries)
}

pub fn delete_archive(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(MigrateError::not_found(ERR_MISSING_ARCHIVE));
    }
    if ArchiveFormat::from_path(path).is_none() {
        return Err(MigrateError::validation(ERR_INVALID_FORMAT));
    }
    fs::remove_file(path)?;
    info!(archive = %path.display(), "backup archive deleted");
    Ok(())
}

/// Deletes archives whose modification time is more than `days` days old.
/// Individual delete failures are collected in the report.
pub fn prune_older_than(directory: impl AsRef<Path>, days: u32) -> Result<PruneReport> {
    let max_age = Duration::from_secs(u64::from(days) * SECONDS_PER_DAY);
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut report = PruneReport::default();
    for entry in list_archives(directory)? {
        if entry.modified >= cutoff {
            continue;
        }
        match fs::remove_file(&entry.path) {
            Ok(()) => report.deleted.push(entry.path),
            Err(error) => {
                warn!(archive = %entry.path.display(), %error, "failed to prune archive");
                report.failed.push((entry.path, error.to_string()));
            }
        }
    }
    info!(deleted = report.deleted_count(), days, "old backup archives pruned");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn write_aged(path: &Path, days: u64) {
        fs::write(path, b"archive").unwrap();
        let modified = SystemTime::now() - Duration::from_secs(days * SECONDS_PER_DAY);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    #[test]
    fn prune_removes_only_old_archives() {
        let dir = tempfile::tempdir().unwrap();
        for days in [5u64, 31, 45, 10, 60] {
            write_aged(&dir.path().join(format!("backup_{}.tar.gz", days)), days);
        }
        write_aged(&dir.path().join("unrelated.txt"), 90);

        let report = prune_older_than(dir.path(), 30).unwrap();
        assert_eq!(report.deleted_count(), 3);
        assert!(report.failed.is_empty());

        let remaining: Vec<String> = list_archives(dir.path())
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(remaining, vec!["backup_5.tar.gz", "backup_10.tar.gz"]);
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn listing_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_aged(&dir.path().join("old.zip"), 3);
        write_aged(&dir.path().join("new.zip"), 1);
        write_aged(&dir.path().join("mid.tar.gz"), 2);

        let names: Vec<String> = list_archives(dir.path())
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["new.zip", "mid.tar.gz", "old.zip"]);
    }

    #[test]
    fn missing_directory_lists_nothing() {
        assert!(list_archives("/definitely/not/a/backup/dir").unwrap().is_empty());
    }

    #[test]
    fn delete_reports_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        match delete_archive(dir.path().join("gone.zip")) {
            Err(MigrateError::NotFound(message)) => assert_eq!(message, ERR_MISSING_ARCHIVE),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn delete_removes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.zip");
        fs::write(&path, b"zip").unwrap();
        delete_archive(&path).unwrap();
        assert!(!path.exists());
    }
}
