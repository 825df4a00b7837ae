//! Best-effort name and version extraction once a family has been chosen.

use crate::{OsFamily, OsInfo, UNKNOWN};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const OS_RELEASE_PATHS: [&str; 2] = ["etc/os-release", "usr/lib/os-release"];
const DISK_INFO_PATH: &str = ".disk/info";
const SYSTEM_VERSION_PLIST: &str = "System/Library/CoreServices/SystemVersion.plist";
const WINDOWS_INSTALLER: &str = "setup.exe";

pub(crate) fn extract(family: OsFamily, root: &Path) -> OsInfo {
    match family {
        OsFamily::Windows => windows_info(root),
        OsFamily::Linux => linux_info(root),
        OsFamily::Macos => macos_info(root),
        OsFamily::Unknown => OsInfo::unknown(),
    }
}

fn base(family: OsFamily, name: &str) -> OsInfo {
    OsInfo {
        family,
        name: name.to_string(),
        version: UNKNOWN.to_string(),
        installer: None,
        version_file: None,
    }
}

fn windows_info(root: &Path) -> OsInfo {
    let mut info = base(OsFamily::Windows, "Windows");
    info.installer = find_file(root, WINDOWS_INSTALLER);
    info
}

fn linux_info(root: &Path) -> OsInfo {
    let mut info = base(OsFamily::Linux, "Linux");
    for relative in OS_RELEASE_PATHS {
        let path = root.join(relative);
        let Ok(data) = fs::read_to_string(&path) else {
            continue;
        };
        let (name, version) = parse_os_release(&data);
        if let Some(name) = name {
            info.name = name;
        }
        if let Some(version) = version {
            info.version = version;
        }
        info.version_file = Some(path);
        return info;
    }

    // Live media often ship only a one-line disk label.
    let disk_info = root.join(DISK_INFO_PATH);
    if let Ok(data) = fs::read_to_string(&disk_info) {
        if let Some(line) = data.lines().map(str::trim).find(|line| !line.is_empty()) {
            info.version = line.to_string();
            info.version_file = Some(disk_info);
        }
    }
    info
}

fn macos_info(root: &Path) -> OsInfo {
    let mut info = base(OsFamily::Macos, "macOS");
    let path = root.join(SYSTEM_VERSION_PLIST);
    if !path.is_file() {
        return info;
    }
    match plist::Value::from_file(&path) {
        Ok(value) => {
            if let Some(dict) = value.as_dictionary() {
                if let Some(name) = dict.get("ProductName").and_then(|value| value.as_string()) {
                    info.name = name.to_string();
                }
                if let Some(version) = dict.get("ProductVersion").and_then(|value| value.as_string()) {
                    info.version = version.to_string();
                }
                info.version_file = Some(path);
            }
        }
        Err(error) => debug!(%error, "unreadable SystemVersion.plist"),
    }
    info
}

pub(crate) fn parse_os_release(data: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut version = None;
    for line in data.lines() {
        if line.starts_with("NAME=") && name.is_none() {
            name = Some(trim_os_value(line));
        } else if line.starts_with("VERSION=") && version.is_none() {
            version = Some(trim_os_value(line));
        }
    }
    (name.filter(|value| !value.is_empty()), version.filter(|value| !value.is_empty()))
}

fn trim_os_value(line: &str) -> String {
    let value = line.splitn(2, '=').nth(1).unwrap_or("").trim();
    value.trim_matches('"').trim_matches('\'').to_string()
}

fn find_file(root: &Path, file_name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry.file_type().is_file()
                && entry.file_name().to_string_lossy().eq_ignore_ascii_case(file_name)
        })
        .map(|entry| entry.path().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_takes_first_name_and_version() {
        let (name, version) = parse_os_release(
            "PRETTY_NAME=\"Fedora Linux 40\"\nNAME='Fedora Linux'\nVERSION=40 (Workstation Edition)\nNAME=Other\n",
        );
        assert_eq!(name.as_deref(), Some("Fedora Linux"));
        assert_eq!(version.as_deref(), Some("40 (Workstation Edition)"));
    }

    #[test]
    fn disk_label_used_without_os_release() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".disk")).unwrap();
        fs::write(
            dir.path().join(DISK_INFO_PATH),
            "Ubuntu 24.04 LTS \"Noble Numbat\" - Release amd64\n",
        )
        .unwrap();
        let info = linux_info(dir.path());
        assert_eq!(info.name, "Linux");
        assert_eq!(info.version, "Ubuntu 24.04 LTS \"Noble Numbat\" - Release amd64");
    }

    #[test]
    fn macos_plist_supplies_name_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SYSTEM_VERSION_PLIST);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut dict = plist::Dictionary::new();
        dict.insert("ProductName".to_string(), plist::Value::String("macOS".to_string()));
        dict.insert("ProductVersion".to_string(), plist::Value::String("14.5".to_string()));
        plist::Value::Dictionary(dict).to_file_xml(&path).unwrap();

        let info = macos_info(dir.path());
        assert_eq!(info.version, "14.5");
        assert_eq!(info.version_file, Some(path));
    }

    #[test]
    fn malformed_plist_leaves_version_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SYSTEM_VERSION_PLIST);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not a plist").unwrap();
        assert_eq!(macos_info(dir.path()).version, UNKNOWN);
    }
}
