use std::path::{Path, PathBuf};

/// Installer entry points looked up at the root of a mounted image, in priority order.
pub const INSTALLER_CANDIDATES: &[&str] = &[
    "setup.exe",
    "install.exe",
    "autorun.exe",
    "install.sh",
    "setup.sh",
    "installer",
];

pub fn find_installer(mount_point: &Path) -> Option<PathBuf> {
    INSTALLER_CANDIDATES
        .iter()
        .map(|name| mount_point.join(name))
        .find(|candidate| candidate.exists())
}
