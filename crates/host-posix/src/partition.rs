//! Partition driver backed by `lsblk`, `parted` and the `mkfs.*` family.

use osmigrate_bootloader_core::grub::split_partition;
use osmigrate_core::{
    MigrateError, OperationLog, OperationRecord, PartitionDriver, PartitionInfo, Result,
    StageOutcome, ToolCommand, ToolRunner,
};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

const LSBLK_COLUMNS: &str = "NAME,PATH,TYPE,FSTYPE,SIZE,MOUNTPOINT,LABEL,UUID,PKNAME";
const PROTECTED_MOUNTS: [&str; 3] = ["/", "/boot", "/boot/efi"];
const SIZE_PATTERN: &str = r"^(\d+(?:\.\d+)?)(B|kB|KB|MB|GB|TB|KiB|MiB|GiB|TiB|%)$";
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystem {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Vfat,
    Ntfs,
    Exfat,
}

impl FileSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystem::Ext2 => "ext2",
            FileSystem::Ext3 => "ext3",
            FileSystem::Ext4 => "ext4",
            FileSystem::Xfs => "xfs",
            FileSystem::Btrfs => "btrfs",
            FileSystem::Vfat => "vfat",
            FileSystem::Ntfs => "ntfs",
            FileSystem::Exfat => "exfat",
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, FileSystem::Ext2 | FileSystem::Ext3 | FileSystem::Ext4)
    }

    pub fn mkfs_command(&self, device: &str, label: Option<&str>) -> ToolCommand {
        let mut command = ToolCommand::new(format!("mkfs.{}", self.as_str()));
        command = match self {
            FileSystem::Ext2 | FileSystem::Ext3 | FileSystem::Ext4 | FileSystem::Ntfs => command.arg("-F"),
            FileSystem::Xfs | FileSystem::Btrfs => command.arg("-f"),
            FileSystem::Vfat => command.args(["-F", "32"]),
            FileSystem::Exfat => command,
        };
        if let Some(label) = label {
            let flag = if *self == FileSystem::Vfat { "-n" } else { "-L" };
            command = command.arg(flag).arg(label);
        }
        command.arg(device)
    }
}

pub fn parse_filesystem(value: &str) -> Option<FileSystem> {
    match value.trim().to_ascii_lowercase().as_str() {
        "ext2" => Some(FileSystem::Ext2),
        "ext3" => Some(FileSystem::Ext3),
        "ext4" => Some(FileSystem::Ext4),
        "xfs" => Some(FileSystem::Xfs),
        "btrfs" => Some(FileSystem::Btrfs),
        "vfat" | "fat" | "fat32" => Some(FileSystem::Vfat),
        "ntfs" => Some(FileSystem::Ntfs),
        "exfat" => Some(FileSystem::Exfat),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    path: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    fstype: Option<String>,
    size: Option<String>,
    mountpoint: Option<String>,
    label: Option<String>,
    uuid: Option<String>,
    pkname: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Partitions (`type` = `part`) anywhere in an `lsblk -J` device tree.
pub fn parse_lsblk(stdout: &str) -> Result<Vec<PartitionInfo>> {
    let output: LsblkOutput = serde_json::from_str(stdout)?;
    let mut partitions = Vec::new();
    collect_partitions(&output.blockdevices, None, &mut partitions);
    Ok(partitions)
}

fn collect_partitions(devices: &[LsblkDevice], parent: Option<&str>, out: &mut Vec<PartitionInfo>) {
    for device in devices {
        let path = device
            .path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", device.name));
        if device.kind.as_deref() == Some("part") {
            let disk = device
                .pkname
                .as_ref()
                .map(|name| format!("/dev/{}", name))
                .or_else(|| parent.map(str::to_string));
            out.push(PartitionInfo {
                id: path.clone(),
                disk,
                label: device.label.clone(),
                fs: device.fstype.clone(),
                size: device.size.clone(),
                mount_points: device.mountpoint.iter().cloned().collect(),
                uuid: device.uuid.clone(),
            });
        }
        collect_partitions(&device.children, Some(path.as_str()), out);
    }
}

/// Device paths end up as tool arguments, so only plain `/dev/...` names are accepted.
pub fn check_device_path(device: &str) -> Result<()> {
    let name = device.strip_prefix("/dev/").unwrap_or("");
    let valid = !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(MigrateError::validation(format!("invalid device path: {}", device)))
    }
}

fn size_pattern() -> Result<Regex> {
    Regex::new(SIZE_PATTERN).map_err(|error| MigrateError::Parse(error.to_string()))
}

fn check_size(size: &str) -> Result<()> {
    if size_pattern()?.is_match(size) {
        Ok(())
    } else {
        Err(MigrateError::validation(format!("invalid partition size: {}", size)))
    }
}

/// Converts a parted size (`20GiB`, `500MB`, `25%`) to bytes; percentages are of `disk_size`.
pub fn size_in_bytes(size: &str, disk_size: u64) -> Result<u64> {
    let invalid = || MigrateError::validation(format!("invalid partition size: {}", size));
    let captures = size_pattern()?.captures(size).ok_or_else(invalid)?;
    let value: f64 = captures[1].parse().map_err(|_| invalid())?;
    let unit: f64 = match &captures[2] {
        "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => MIB as f64,
        "GiB" => (MIB * 1024) as f64,
        "TiB" => (MIB * 1024 * 1024) as f64,
        _ => disk_size as f64 / 100.0,
    };
    Ok((value * unit) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub size: u64,
    pub free: Vec<FreeRegion>,
}

impl DiskLayout {
    /// First free region that holds `wanted` bytes (at least 1 MiB) from a MiB-aligned start.
    /// Returns the inclusive byte range to pass to `mkpart`.
    pub fn place(&self, wanted: Option<u64>) -> Option<(u64, u64)> {
        let needed = wanted.unwrap_or(MIB).max(MIB);
        self.free.iter().find_map(|region| {
            let start = region.start.div_ceil(MIB) * MIB;
            if start > region.end || region.end - start + 1 < needed {
                return None;
            }
            let end = match wanted {
                Some(_) => start + needed - 1,
                None => region.end,
            };
            Some((start, end))
        })
    }
}

fn parse_bytes(field: &str) -> Result<u64> {
    field
        .strip_suffix('B')
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| MigrateError::Parse(format!("unexpected parted byte value: {}", field)))
}

/// Reads `parted -m <disk> unit B print free`: the disk line carries the total size,
/// free-space lines end with a `free` field.
pub fn parse_parted_free(stdout: &str) -> Result<DiskLayout> {
    let mut lines = stdout
        .lines()
        .map(|line| line.trim().trim_end_matches(';'))
        .filter(|line| !line.is_empty() && *line != "BYT");
    let disk_line = lines
        .next()
        .ok_or_else(|| MigrateError::Parse("parted printed no disk line".to_string()))?;
    let size = disk_line
        .split(':')
        .nth(1)
        .ok_or_else(|| MigrateError::Parse(format!("unexpected parted disk line: {}", disk_line)))
        .and_then(parse_bytes)?;

    let mut free = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 5 && fields[4] == "free" {
            free.push(FreeRegion {
                start: parse_bytes(fields[1])?,
                end: parse_bytes(fields[2])?,
            });
        }
    }
    Ok(DiskLayout { size, free })
}

fn check_label(label: &str) -> Result<()> {
    if label.is_empty() || label.len() > 32 || label.chars().any(|ch| ch.is_control()) {
        return Err(MigrateError::validation(format!("invalid filesystem label: {:?}", label)));
    }
    Ok(())
}

fn require_filesystem(value: &str) -> Result<FileSystem> {
    parse_filesystem(value)
        .ok_or_else(|| MigrateError::validation(format!("unsupported filesystem: {}", value)))
}

pub struct PosixPartitionDriver {
    runner: Arc<dyn ToolRunner>,
    install_mount: PathBuf,
    log: OperationLog,
}

impl PosixPartitionDriver {
    pub fn new(runner: Arc<dyn ToolRunner>, install_mount: PathBuf) -> Self {
        Self {
            runner,
            install_mount,
            log: OperationLog::new(),
        }
    }

    pub fn install_mount(&self) -> &std::path::Path {
        &self.install_mount
    }

    fn query(&self, device: Option<&str>) -> Result<Vec<PartitionInfo>> {
        let mut command = ToolCommand::new("lsblk").args(["-J", "-o", LSBLK_COLUMNS]);
        if let Some(device) = device {
            command = command.arg(device);
        }
        let output = self.runner.run(&command)?;
        parse_lsblk(&output.stdout)
    }

    fn inspect(&self, partition_id: &str) -> Result<PartitionInfo> {
        check_device_path(partition_id)?;
        let partitions = self.query(Some(partition_id)).map_err(|error| {
            MigrateError::validation(format!("{} is not a usable partition: {}", partition_id, error))
        })?;
        partitions
            .into_iter()
            .find(|partition| partition.id == partition_id)
            .ok_or_else(|| MigrateError::validation(format!("{} is not a partition", partition_id)))
    }

    fn prepare_partition(&self, partition_id: &str) -> Result<StageOutcome> {
        self.validate(partition_id)?;
        let fs = FileSystem::Ext4;
        self.runner.run(&fs.mkfs_command(partition_id, None))?;
        std::fs::create_dir_all(&self.install_mount)?;
        self.runner.run(
            &ToolCommand::new("mount")
                .arg(partition_id)
                .path_arg(&self.install_mount),
        )?;
        Ok(StageOutcome::new(format!(
            "Partition {} formatted as {} and mounted at {}",
            partition_id,
            fs.as_str(),
            self.install_mount.display()
        )))
    }

    fn partitions_on(&self, disk: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .query(Some(disk))?
            .into_iter()
            .filter(|partition| partition.disk.as_deref() == Some(disk))
            .map(|partition| partition.id)
            .collect())
    }

    fn layout(&self, disk: &str) -> Result<DiskLayout> {
        let output = self.runner.run(
            &ToolCommand::new("parted").args(["-s", "-m", disk, "unit", "B", "print", "free"]),
        )?;
        parse_parted_free(&output.stdout)
    }

    fn create_partition(&self, disk: &str, size: Option<&str>, fs: &str) -> Result<StageOutcome> {
        check_device_path(disk)?;
        let fs = require_filesystem(fs)?;
        if let Some(size) = size {
            check_size(size)?;
        }

        let before = self.partitions_on(disk)?;
        let layout = self.layout(disk)?;
        let wanted = size
            .map(|size| size_in_bytes(size, layout.size))
            .transpose()?;
        let (start, end) = layout.place(wanted).ok_or_else(|| {
            MigrateError::validation(format!(
                "no free region on {} large enough for {}",
                disk,
                size.unwrap_or("a new partition")
            ))
        })?;
        self.runner.run(
            &ToolCommand::new("parted")
                .args(["-s", disk, "unit", "B", "mkpart", "primary"])
                .arg(format!("{}B", start))
                .arg(format!("{}B", end)),
        )?;

        let after = self.partitions_on(disk)?;
        let mut added: Vec<&String> = after.difference(&before).collect();
        let created = match added.len() {
            1 => added.remove(0).clone(),
            0 => {
                return Err(MigrateError::not_found(format!(
                    "no new partition appeared on {}",
                    disk
                )))
            }
            _ => {
                warn!(disk, added = ?added, "several partitions appeared, formatting none");
                return Err(MigrateError::validation(format!(
                    "expected one new partition on {}, found {}",
                    disk,
                    added.len()
                )));
            }
        };
        debug!(disk, partition = %created, start, end, "new partition detected");

        self.runner.run(&fs.mkfs_command(&created, None))?;
        Ok(StageOutcome::new(format!(
            "Created {} on {} formatted as {}",
            created,
            disk,
            fs.as_str()
        )))
    }

    fn delete_partition(&self, partition_id: &str) -> Result<StageOutcome> {
        self.validate(partition_id)?;
        let (disk, number) = split_partition(partition_id)
            .ok_or_else(|| MigrateError::validation(format!("cannot derive disk of {}", partition_id)))?;
        self.runner.run(
            &ToolCommand::new("parted")
                .arg("-s")
                .arg(format!("/dev/{}", disk))
                .args(["rm".to_string(), number.to_string()]),
        )?;
        Ok(StageOutcome::new(format!("Deleted partition {}", partition_id)))
    }

    fn resize_partition(&self, partition_id: &str, size: &str) -> Result<StageOutcome> {
        check_size(size)?;
        let info = self.inspect(partition_id)?;
        reject_protected(&info)?;
        let (disk, number) = split_partition(partition_id)
            .ok_or_else(|| MigrateError::validation(format!("cannot derive disk of {}", partition_id)))?;
        self.runner.run(
            &ToolCommand::new("parted")
                .arg("-s")
                .arg(format!("/dev/{}", disk))
                .arg("resizepart")
                .arg(number.to_string())
                .arg(size),
        )?;

        let grows_fs = info
            .fs
            .as_deref()
            .and_then(parse_filesystem)
            .map(|fs| fs.is_ext())
            .unwrap_or(false);
        if grows_fs {
            self.runner.run(&ToolCommand::new("resize2fs").arg(partition_id))?;
        }
        Ok(StageOutcome::new(format!("Resized {} to {}", partition_id, size)))
    }

    fn format_partition(&self, partition_id: &str, fs: &str, label: Option<&str>) -> Result<StageOutcome> {
        let fs = require_filesystem(fs)?;
        if let Some(label) = label {
            check_label(label)?;
        }
        self.validate(partition_id)?;
        self.runner.run(&fs.mkfs_command(partition_id, label))?;
        Ok(StageOutcome::new(format!("Formatted {} as {}", partition_id, fs.as_str())))
    }
}

fn reject_protected(info: &PartitionInfo) -> Result<()> {
    let protected = info
        .mount_points
        .iter()
        .any(|mount| PROTECTED_MOUNTS.contains(&mount.as_str()));
    if protected {
        return Err(MigrateError::validation(format!(
            "refusing to modify system partition {}",
            info.id
        )));
    }
    Ok(())
}

impl PartitionDriver for PosixPartitionDriver {
    fn validate(&self, partition_id: &str) -> Result<()> {
        let info = self.inspect(partition_id)?;
        reject_protected(&info)
    }

    fn prepare(&self, partition_id: &str) -> Result<StageOutcome> {
        let result = self.prepare_partition(partition_id);
        self.log.track("prepare", partition_id, result)
    }

    fn list(&self) -> Result<Vec<PartitionInfo>> {
        self.query(None)
    }

    fn info(&self, partition_id: &str) -> Result<PartitionInfo> {
        check_device_path(partition_id)?;
        self.query(Some(partition_id))?
            .into_iter()
            .find(|partition| partition.id == partition_id)
            .ok_or_else(|| MigrateError::not_found(format!("Partition {} not found", partition_id)))
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
