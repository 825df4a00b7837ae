//! GRUB custom entry scripts and `/etc/default/grub` editing.

use crate::{validate_entry_name, validate_entry_title};
use osmigrate_core::{MigrateError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};

/// Custom scripts are generated after the distribution's own entries.
pub const CUSTOM_ENTRY_PREFIX: &str = "40_";
pub const DEFAULT_KEY: &str = "GRUB_DEFAULT";

const ROOT_SEARCH: &str = "search --no-floppy --set=root --file /boot/vmlinuz";

pub fn entry_script_path(grub_dir: &Path, name: &str) -> Result<PathBuf> {
    validate_entry_name(name)?;
    Ok(grub_dir.join(format!("{}{}", CUSTOM_ENTRY_PREFIX, name)))
}

/// Renders a `grub.d` script that emits one menu entry booting `partition`.
pub fn render_entry_script(title: &str, partition: &str) -> Result<String> {
    validate_entry_title(title)?;
    if !partition.starts_with("/dev/") || partition.contains(char::is_whitespace) {
        return Err(MigrateError::validation(format!("invalid partition: {}", partition)));
    }
    let root_line = match grub_device(partition) {
        Some(device) => format!("set root=({})", device),
        None => ROOT_SEARCH.to_string(),
    };
    Ok(format!(
        "#!/bin/sh\n\
         exec tail -n +3 $0\n\
         \n\
         menuentry '{title}' {{\n\
         \x20   {root_line}\n\
         \x20   linux /boot/vmlinuz root={partition} ro quiet splash\n\
         \x20   initrd /boot/initrd.img\n\
         }}\n"
    ))
}

/// Splits a partition device into its disk and 1-based partition number:
/// `/dev/sdb1` is `("sdb", 1)`, `/dev/nvme0n1p2` is `("nvme0n1", 2)`.
pub fn split_partition(device: &str) -> Option<(String, u32)> {
    let name = device.strip_prefix("/dev/").unwrap_or(device);
    let digits = name.len() - name.trim_end_matches(|ch: char| ch.is_ascii_digit()).len();
    if digits == 0 || digits == name.len() {
        return None;
    }
    let (base, number) = name.split_at(name.len() - digits);
    let number: u32 = number.parse().ok()?;
    if number == 0 {
        return None;
    }

    let numbered_disk = ["nvme", "mmcblk", "loop"]
        .iter()
        .any(|prefix| base.starts_with(prefix));
    if numbered_disk {
        let disk = base.strip_suffix('p')?;
        if !disk.ends_with(|ch: char| ch.is_ascii_digit()) {
            return None;
        }
        return Some((disk.to_string(), number));
    }
    Some((base.to_string(), number))
}

/// GRUB device name (`hd1,1`) for a Linux partition path, when it can be derived.
pub fn grub_device(partition: &str) -> Option<String> {
    let (disk, number) = split_partition(partition)?;
    let index = disk_index(&disk)?;
    Some(format!("hd{},{}", index, number))
}

fn disk_index(disk: &str) -> Option<u32> {
    for prefix in ["xvd", "sd", "vd", "hd"] {
        if let Some(letter) = disk.strip_prefix(prefix) {
            let mut chars = letter.chars();
            let first = chars.next()?;
            if chars.next().is_some() || !first.is_ascii_lowercase() {
                return None;
            }
            return Some(first as u32 - 'a' as u32);
        }
    }
    if let Some(rest) = disk.strip_prefix("nvme") {
        let controller = rest.split('n').next()?;
        return controller.parse().ok();
    }
    if let Some(rest) = disk.strip_prefix("mmcblk") {
        return rest.parse().ok();
    }
    None
}

/// Value of the first uncommented `GRUB_DEFAULT=` line, unquoted.
pub fn parse_default(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let value = line.trim().strip_prefix(DEFAULT_KEY)?.strip_prefix('=')?;
        Some(value.trim().trim_matches('"').trim_matches('\'').to_string())
    })
}

/// Rewrites (or appends) the `GRUB_DEFAULT` line; every other line is kept as-is.
pub fn set_default(contents: &str, value: &str) -> Result<String> {
    if value.is_empty() || value.contains(|ch: char| ch == '"' || ch == '\\' || ch == '$' || ch.is_control()) {
        return Err(MigrateError::validation(format!("invalid default boot entry: {:?}", value)));
    }
    let replacement = format!("{}=\"{}\"", DEFAULT_KEY, value);
    let mut replaced = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| {
            let is_default = line
                .trim()
                .strip_prefix(DEFAULT_KEY)
                .map(|rest| rest.starts_with('='))
                .unwrap_or(false);
            if is_default && !replaced {
                replaced = true;
                replacement.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(replacement);
    }
    let mut output = lines.join("\n");
    output.push('\n');
    Ok(output)
}

/// Titles of every `menuentry` in a GRUB script.
pub fn menu_entry_titles(script: &str) -> Vec<String> {
    let pattern = match Regex::new(r#"(?m)^\s*menuentry\s+(?:'([^']*)'|"([^"]*)")"#) {
        Ok(pattern) => pattern,
        Err(_) => return Vec::new(),
    };
    pattern
        .captures_iter(script)
        .filter_map(|captures| captures.get(1).or_else(|| captures.get(2)))
        .map(|title| title.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_entry_with_derived_root() {
        let script = render_entry_script("Migrated OS", "/dev/sdb1").unwrap();
        assert!(script.starts_with("#!/bin/sh\nexec tail -n +3 $0\n\nmenuentry 'Migrated OS' {\n"));
        assert!(script.contains("    set root=(hd1,1)\n"));
        assert!(script.contains("    linux /boot/vmlinuz root=/dev/sdb1 ro quiet splash\n"));
        assert!(script.ends_with("    initrd /boot/initrd.img\n}\n"));
        assert_eq!(menu_entry_titles(&script), vec!["Migrated OS"]);
    }

    #[test]
    fn falls_back_to_search_for_unknown_devices() {
        let script = render_entry_script("Migrated OS", "/dev/mapper/vg-root").unwrap();
        assert!(script.contains(ROOT_SEARCH));
    }

    #[test]
    fn rejects_unsafe_inputs() {
        assert!(render_entry_script("Bad 'title'", "/dev/sda1").is_err());
        assert!(render_entry_script("Migrated OS", "sda1; reboot").is_err());
        assert!(entry_script_path(Path::new("/etc/grub.d"), "../x").is_err());
        assert_eq!(
            entry_script_path(Path::new("/etc/grub.d"), "osmigrate").unwrap(),
            PathBuf::from("/etc/grub.d/40_osmigrate")
        );
    }

    #[test]
    fn splits_partition_names() {
        assert_eq!(split_partition("/dev/sdb1"), Some(("sdb".to_string(), 1)));
        assert_eq!(split_partition("/dev/nvme0n1p2"), Some(("nvme0n1".to_string(), 2)));
        assert_eq!(split_partition("/dev/mmcblk0p1"), Some(("mmcblk0".to_string(), 1)));
        assert_eq!(split_partition("/dev/nvme0n1"), None);
        assert_eq!(split_partition("/dev/sda"), None);
    }

    #[test]
    fn derives_grub_devices() {
        assert_eq!(grub_device("/dev/sda3").as_deref(), Some("hd0,3"));
        assert_eq!(grub_device("/dev/sdb1").as_deref(), Some("hd1,1"));
        assert_eq!(grub_device("/dev/nvme1n1p2").as_deref(), Some("hd1,2"));
        assert_eq!(grub_device("/dev/sdaa1"), None);
    }

    #[test]
    fn edits_default_line_in_place() {
        let original = "# comment\nGRUB_DEFAULT=0\nGRUB_TIMEOUT=5\n";
        assert_eq!(parse_default(original).as_deref(), Some("0"));

        let updated = set_default(original, "Migrated OS").unwrap();
        assert_eq!(updated, "# comment\nGRUB_DEFAULT=\"Migrated OS\"\nGRUB_TIMEOUT=5\n");
        assert_eq!(parse_default(&updated).as_deref(), Some("Migrated OS"));
    }

    #[test]
    fn appends_missing_default_and_ignores_comments() {
        let original = "#GRUB_DEFAULT=saved\nGRUB_TIMEOUT=5";
        assert_eq!(parse_default(original), None);
        let updated = set_default(original, "1").unwrap();
        assert!(updated.ends_with("GRUB_TIMEOUT=5\nGRUB_DEFAULT=\"1\"\n"));
        assert!(set_default(original, "x\"; rm").is_err());
    }
}
