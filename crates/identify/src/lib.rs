//! Heuristic classification of the operating system contained in a mounted image tree.
//!
//! Signature sets are tried in a fixed order and the first accepted family wins, so
//! trees that carry markers for several families resolve deterministically.

use osmigrate_core::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

mod signature;
mod version;

pub use signature::{builtin_signatures, OsSignature};

pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
    Macos,
    Unknown,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Windows => "windows",
            OsFamily::Linux => "linux",
            OsFamily::Macos => "macos",
            OsFamily::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub family: OsFamily,
    pub name: String,
    pub version: String,
    /// Installer binary found in the tree, when the family records one.
    pub installer: Option<PathBuf>,
    /// Release descriptor the version was read from, when one exists.
    pub version_file: Option<PathBuf>,
}

impl OsInfo {
    pub fn unknown() -> Self {
        Self {
            family: OsFamily::Unknown,
            name: UNKNOWN.to_string(),
            version: UNKNOWN.to_string(),
            installer: None,
            version_file: None,
        }
    }
}

/// Why a signature set accepted a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchReason {
    NamePattern(String),
    MarkerFile(String),
    MarkerDirectory(String),
}

pub struct Classifier {
    signatures: Vec<OsSignature>,
}

impl Classifier {
    pub fn new(signatures: Vec<OsSignature>) -> Self {
        Self { signatures }
    }

    pub fn builtin() -> Result<Self> {
        Ok(Self::new(builtin_signatures()?))
    }

    pub fn signatures(&self) -> &[OsSignature] {
        &self.signatures
    }

    pub fn classify(&self, root: impl AsRef<Path>) -> Result<OsInfo> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(MigrateError::validation(format!(
                "image root is not a directory: {}",
                root.display()
            )));
        }

        let names = collect_file_names(root);
        for signature in &self.signatures {
            if let Some(reason) = signature.match_tree(root, &names) {
                debug!(family = signature.family.as_str(), ?reason, "signature accepted image tree");
                return Ok(version::extract(signature.family, root));
            }
        }
        debug!(root = %root.display(), "no signature matched image tree");
        Ok(OsInfo::unknown())
    }
}

/// File names (not directories) anywhere under `root`. Unreadable subtrees are skipped.
fn collect_file_names(root: &Path) -> Vec<String> {
    let mut names = Vec::new();
    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "skipping unreadable entry while classifying"),
        }
    }
    names
}
