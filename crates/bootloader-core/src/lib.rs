use osmigrate_core::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod bcd;
pub mod grub;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EfiLoader {
    pub path: String,
    pub arch: BootArch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootArch {
    X64,
    Aarch64,
    Ia32,
}

/// Removable-media UEFI loaders present under an image root.
pub fn detect_efi_loaders(root: impl AsRef<Path>) -> Vec<EfiLoader> {
    let root: PathBuf = root.as_ref().to_path_buf();
    let mut loaders = Vec::new();
    for (rel, arch) in [
        ("EFI/BOOT/BOOTX64.EFI", BootArch::X64),
        ("EFI/BOOT/BOOTAA64.EFI", BootArch::Aarch64),
        ("EFI/BOOT/BOOTIA32.EFI", BootArch::Ia32),
    ] {
        if root.join(rel).is_file() {
            loaders.push(EfiLoader {
                path: rel.to_string(),
                arch,
            });
        }
    }
    loaders
}

/// Boot entry names become file names and menu identifiers, so only
/// ASCII letters, digits, `-` and `_` are allowed.
pub fn validate_entry_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(MigrateError::validation(format!("invalid boot entry name: {:?}", name)))
    }
}

/// Menu titles end up inside quoted boot configuration values.
pub fn validate_entry_title(title: &str) -> Result<()> {
    let valid = !title.trim().is_empty()
        && !title
            .chars()
            .any(|ch| ch == '\'' || ch == '"' || ch.is_control());
    if valid {
        Ok(())
    } else {
        Err(MigrateError::validation(format!("invalid boot entry title: {:?}", title)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_efi_loaders_by_arch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("EFI/BOOT")).unwrap();
        std::fs::write(dir.path().join("EFI/BOOT/BOOTX64.EFI"), b"").unwrap();
        std::fs::write(dir.path().join("EFI/BOOT/BOOTIA32.EFI"), b"").unwrap();

        let arches: Vec<BootArch> = detect_efi_loaders(dir.path())
            .into_iter()
            .map(|loader| loader.arch)
            .collect();
        assert_eq!(arches, vec![BootArch::X64, BootArch::Ia32]);
    }

    #[test]
    fn entry_names_reject_path_characters() {
        assert!(validate_entry_name("osmigrate").is_ok());
        assert!(validate_entry_name("fedora_40-test").is_ok());
        assert!(validate_entry_name("").is_err());
        assert!(validate_entry_name("../grub").is_err());
        assert!(validate_entry_name("a b").is_err());
    }

    #[test]
    fn titles_reject_quotes() {
        assert!(validate_entry_title("Migrated OS").is_ok());
        assert!(validate_entry_title("it's").is_err());
        assert!(validate_entry_title("line\nbreak").is_err());
        assert!(validate_entry_title("  ").is_err());
    }
}
