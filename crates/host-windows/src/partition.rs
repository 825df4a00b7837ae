//! Partition driver built on the PowerShell Storage module (`Get-Partition`,
//! `New-Partition`, `Format-Volume` and friends).

use crate::{powershell, ps_quote_str};
use osmigrate_core::{
    MigrateError, OperationLog, OperationRecord, PartitionDriver, PartitionInfo, Result,
    StageOutcome, ToolRunner,
};
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const SIZE_PATTERN: &str = r"^\d+(KB|MB|GB|TB)$";

/// Projection appended to a `Get-Partition` pipeline. Drive letters are stringified
/// because PowerShell serializes an unassigned letter as a NUL char.
const PARTITION_PROJECTION: &str = "ForEach-Object { \
$v = $_ | Get-Volume -ErrorAction SilentlyContinue; \
[pscustomobject]@{ DiskNumber = $_.DiskNumber; PartitionNumber = $_.PartitionNumber; \
DriveLetter = [string]$_.DriveLetter; Size = $_.Size; Guid = $_.Guid; \
FileSystem = $v.FileSystem; Label = $v.FileSystemLabel } } | ConvertTo-Json -Compress";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystem {
    Fat32,
    Ntfs,
    ExFat,
}

impl FileSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystem::Fat32 => "FAT32",
            FileSystem::Ntfs => "NTFS",
            FileSystem::ExFat => "exFAT",
        }
    }

    pub fn max_label_len(&self) -> usize {
        match self {
            FileSystem::Fat32 => 11,
            FileSystem::Ntfs => 32,
            FileSystem::ExFat => 15,
        }
    }
}

pub fn parse_filesystem(value: &str) -> Option<FileSystem> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fat32" | "vfat" => Some(FileSystem::Fat32),
        "ntfs" => Some(FileSystem::Ntfs),
        "exfat" => Some(FileSystem::ExFat),
        _ => None,
    }
}

/// Accepts `D`, `D:` or `D:\` and returns the upper-case letter.
pub fn parse_drive_letter(partition_id: &str) -> Result<char> {
    let trimmed = partition_id.trim();
    let body = trimmed.strip_suffix('\\').unwrap_or(trimmed);
    let body = body.strip_suffix(':').unwrap_or(body);
    let mut chars = body.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) if letter.is_ascii_alphabetic() => Ok(letter.to_ascii_uppercase()),
        _ => Err(MigrateError::validation(format!(
            "invalid drive letter: {}",
            partition_id
        ))),
    }
}

/// Letter of the running system's drive, from `%SystemDrive%` (default `C:`).
pub fn system_drive() -> char {
    std::env::var("SystemDrive")
        .ok()
        .and_then(|value| parse_drive_letter(&value).ok())
        .unwrap_or('C')
}

fn check_disk_number(disk: &str) -> Result<u32> {
    disk.trim()
        .parse::<u32>()
        .map_err(|_| MigrateError::validation(format!("invalid disk number: {}", disk)))
}

fn check_size(size: &str) -> Result<()> {
    let pattern = Regex::new(SIZE_PATTERN).map_err(|error| MigrateError::Parse(error.to_string()))?;
    if pattern.is_match(size) {
        Ok(())
    } else {
        Err(MigrateError::validation(format!("invalid partition size: {}", size)))
    }
}

fn require_filesystem(value: &str) -> Result<FileSystem> {
    parse_filesystem(value)
        .ok_or_else(|| MigrateError::validation(format!("unsupported filesystem: {}", value)))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsPartition {
    disk_number: Option<u32>,
    partition_number: Option<u32>,
    drive_letter: Option<String>,
    size: Option<u64>,
    guid: Option<String>,
    file_system: Option<String>,
    label: Option<String>,
}

impl PsPartition {
    fn letter(&self) -> Option<char> {
        self.drive_letter
            .as_deref()
            .and_then(|value| value.chars().next())
            .filter(|letter| letter.is_ascii_alphabetic())
            .map(|letter| letter.to_ascii_uppercase())
    }

    fn into_info(self) -> PartitionInfo {
        let letter = self.letter();
        let id = match letter {
            Some(letter) => format!("{}:", letter),
            None => format!(
                "Disk{}#{}",
                self.disk_number.unwrap_or_default(),
                self.partition_number.unwrap_or_default()
            ),
        };
        PartitionInfo {
            id,
            disk: self.disk_number.map(|number| number.to_string()),
            label: self.label.filter(|label| !label.is_empty()),
            fs: self.file_system.filter(|fs| !fs.is_empty()),
            size: self.size.map(|size| size.to_string()),
            mount_points: letter.map(|letter| format!("{}:\\", letter)).into_iter().collect(),
            uuid: self.guid.filter(|guid| !guid.is_empty()),
        }
    }
}

/// Partitions from `ConvertTo-Json` output, which is a bare object for a single result
/// and empty when nothing matched.
pub fn parse_partitions(stdout: &str) -> Result<Vec<PartitionInfo>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: OneOrMany<PsPartition> = serde_json::from_str(trimmed)?;
    let partitions = match parsed {
        OneOrMany::Many(partitions) => partitions,
        OneOrMany::One(partition) => vec![partition],
    };
    Ok(partitions.into_iter().map(PsPartition::into_info).collect())
}

pub struct WindowsPartitionDriver {
    runner: Arc<dyn ToolRunner>,
    system_drive: char,
    log: OperationLog,
}

impl WindowsPartitionDriver {
    pub fn new(runner: Arc<dyn ToolRunner>, system_drive: char) -> Self {
        Self {
            runner,
            system_drive: system_drive.to_ascii_uppercase(),
            log: OperationLog::new(),
        }
    }

    /// Parses the id and refuses the running system's drive.
    fn target_letter(&self, partition_id: &str) -> Result<char> {
        let letter = parse_drive_letter(partition_id)?;
        if letter == self.system_drive {
            return Err(MigrateError::validation(format!(
                "refusing to modify system drive {}:",
                letter
            )));
        }
        Ok(letter)
    }

    fn query(&self, letter: Option<char>) -> Result<Vec<PartitionInfo>> {
        let script = match letter {
            Some(letter) => format!("Get-Partition -DriveLetter {} | {}", letter, PARTITION_PROJECTION),
            None => format!("Get-Partition | {}", PARTITION_PROJECTION),
        };
        let output = self.runner.run(&powershell(script))?;
        parse_partitions(&output.stdout)
    }

    fn prepare_partition(&self, partition_id: &str) -> Result<StageOutcome> {
        self.validate(partition_id)?;
        let letter = self.target_letter(partition_id)?;
        self.runner.run(&powershell(format!(
            "Get-Partition -DriveLetter {} | Set-Partition -IsActive $true",
            letter
        )))?;
        self.runner.run(&powershell(format!(
            "Format-Volume -DriveLetter {} -FileSystem {} -Confirm:$false -Force",
            letter,
            FileSystem::Ntfs.as_str()
        )))?;
        Ok(StageOutcome::new(format!(
            "Partition {}: marked active and formatted as NTFS",
            letter
        )))
    }

    fn create_partition(&self, disk: &str, size: Option<&str>, fs: &str) -> Result<StageOutcome> {
        let disk_number = check_disk_number(disk)?;
        let fs = require_filesystem(fs)?;
        let size_arg = match size {
            Some(size) => {
                check_size(size)?;
                format!("-Size {}", size)
            }
            None => "-UseMaximumSize".to_string(),
        };
        let output = self.runner.run(&powershell(format!(
            "New-Partition -DiskNumber {} {} -AssignDriveLetter | \
             Format-Volume -FileSystem {} -Confirm:$false -Force | \
             Select-Object -ExpandProperty DriveLetter",
            disk_number,
            size_arg,
            fs.as_str()
        )))?;
        let letter = output.stdout.trim().chars().next().filter(char::is_ascii_alphabetic);
        debug!(disk = disk_number, letter = ?letter, "new partition created");
        Ok(StageOutcome::new(match letter {
            Some(letter) => format!(
                "Created {}: on disk {} formatted as {}",
                letter,
                disk_number,
                fs.as_str()
            ),
            None => format!("Created partition on disk {} formatted as {}", disk_number, fs.as_str()),
        }))
    }

    fn delete_partition(&self, partition_id: &str) -> Result<StageOutcome> {
        self.validate(partition_id)?;
        let letter = self.target_letter(partition_id)?;
        self.runner.run(&powershell(format!(
            "Remove-Partition -DriveLetter {} -Confirm:$false",
            letter
        )))?;
        Ok(StageOutcome::new(format!("Deleted partition {}:", letter)))
    }

    fn resize_partition(&self, partition_id: &str, size: &str) -> Result<StageOutcome> {
        let letter = self.target_letter(partition_id)?;
        let size_expr = if size.eq_ignore_ascii_case("max") {
            format!("(Get-PartitionSupportedSize -DriveLetter {}).SizeMax", letter)
        } else {
            check_size(size)?;
            size.to_string()
        };
        self.validate(partition_id)?;
        self.runner.run(&powershell(format!(
            "Resize-Partition -DriveLetter {} -Size {}",
            letter, size_expr
        )))?;
        Ok(StageOutcome::new(format!("Resized {}: to {}", letter, size)))
    }

    fn format_partition(&self, partition_id: &str, fs: &str, label: Option<&str>) -> Result<StageOutcome> {
        let fs = require_filesystem(fs)?;
        let letter = self.target_letter(partition_id)?;
        let mut script = format!("Format-Volume -DriveLetter {} -FileSystem {}", letter, fs.as_str());
        if let Some(label) = label {
            if label.is_empty()
                || label.chars().count() > fs.max_label_len()
                || label.chars().any(|ch| ch.is_control())
            {
                return Err(MigrateError::validation(format!(
                    "invalid {} label: {:?}",
                    fs.as_str(),
                    label
                )));
            }
            script.push_str(&format!(" -NewFileSystemLabel {}", ps_quote_str(label)));
        }
        script.push_str(" -Confirm:$false -Force");
        self.validate(partition_id)?;
        self.runner.run(&powershell(script))?;
        Ok(StageOutcome::new(format!("Formatted {}: as {}", letter, fs.as_str())))
    }
}

impl PartitionDriver for WindowsPartitionDriver {
    fn validate(&self, partition_id: &str) -> Result<()> {
        let letter = self.target_letter(partition_id)?;
        let found = self.query(Some(letter)).map_err(|error| {
            MigrateError::validation(format!("{}: is not a usable partition: {}", letter, error))
        })?;
        if found.is_empty() {
            return Err(MigrateError::validation(format!("{}: is not a partition", letter)));
        }
        Ok(())
    }

    fn prepare(&self, partition_id: &str) -> Result<StageOutcome> {
        let result = self.prepare_partition(partition_id);
        self.log.track("prepare", partition_id, result)
    }

    fn list(&self) -> Result<Vec<PartitionInfo>> {
        self.query(None)
    }

    fn info(&self, partition_id: &str) -> Result<PartitionInfo> {
        let letter = parse_drive_letter(partition_id)?;
        let not_found = || MigrateError::not_found(format!("Partition {}: not found", letter));
        self.query(Some(letter))
            .map_err(|_| not_found())?
            .into_iter()
            .next()
            .ok_or_else(not_found)
    }

    fn create(&self, disk: &str, size: Option<&str>, fs: &str) -> Result<StageOutcome> {
        let result = self.create_partition(disk, size, fs);
        self.log.track("create", disk, result)
    }

    fn delete(&self, partition_id: &str) -> Result<StageOutcome> {
        let result = self.delete_partition(partition_id);
        self.log.track("delete", partition_id, result)
    }

    fn resize(&self, partition_id: &str, size: &str) -> Result<StageOutcome> {
        let result = self.resize_partition(partition_id, size);
        self.log.track("resize", partition_id, result)
    }

    fn format(&self, partition_id: &str, fs: &str, label: Option<&str>) -> Result<StageOutcome> {
        let result = self.format_partition(partition_id, fs, label);
        self.log.track("format", partition_id, result)
    }

    fn operation_log(&self) -> Vec<OperationRecord> {
        self.log.records()
    }
}
