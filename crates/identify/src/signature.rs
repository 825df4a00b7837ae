use crate::{MatchReason, OsFamily};
use osmigrate_core::{MigrateError, Result};
use regex::{Regex, RegexBuilder};
use std::path::Path;

/// One family's heuristics. Any single rule is enough to accept a tree.
#[derive(Debug, Clone)]
pub struct OsSignature {
    pub family: OsFamily,
    patterns: Vec<Regex>,
    marker_files: Vec<String>,
    marker_dirs: Vec<String>,
}

impl OsSignature {
    pub fn new(
        family: OsFamily,
        patterns: &[&str],
        marker_files: &[&str],
        marker_dirs: &[&str],
    ) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|error| MigrateError::Parse(format!("bad name pattern {}: {}", pattern, error)))?;
            compiled.push(regex);
        }
        Ok(Self {
            family,
            patterns: compiled,
            marker_files: marker_files.iter().map(|name| name.to_string()).collect(),
            marker_dirs: marker_dirs.iter().map(|name| name.to_string()).collect(),
        })
    }

    /// `names` holds every file name found under `root`; directories are probed
    /// only at the top level.
    pub fn match_tree(&self, root: &Path, names: &[String]) -> Option<MatchReason> {
        for name in names {
            if let Some(regex) = self.patterns.iter().find(|regex| regex.is_match(name)) {
                return Some(MatchReason::NamePattern(format!("{} ~ {}", name, regex.as_str())));
            }
        }
        for name in names {
            if self
                .marker_files
                .iter()
                .any(|marker| marker.eq_ignore_ascii_case(name))
            {
                return Some(MatchReason::MarkerFile(name.clone()));
            }
        }
        self.marker_dirs
            .iter()
            .find(|dir| root.join(dir.as_str()).is_dir())
            .map(|dir| MatchReason::MarkerDirectory(dir.clone()))
    }
}

/// Built-in sets in evaluation order: Windows, then Linux, then macOS.
pub fn builtin_signatures() -> Result<Vec<OsSignature>> {
    Ok(vec![
        OsSignature::new(
            OsFamily::Windows,
            &["windows", "winnt", "win32"],
            &["bootmgr", "ntldr", "winload.exe"],
            &["Windows", "Program Files"],
        )?,
        OsSignature::new(
            OsFamily::Linux,
            &["linux", "ubuntu", "debian", "fedora", "centos"],
            &["vmlinuz", "initrd.img", "grub.cfg"],
            &["boot", "etc", "usr"],
        )?,
        OsSignature::new(
            OsFamily::Macos,
            &["macos", "darwin", r"mac\s+os"],
            &["mach_kernel", "boot.efi"],
            &["System", "Applications"],
        )?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_order_is_fixed() {
        let families: Vec<OsFamily> = builtin_signatures()
            .unwrap()
            .iter()
            .map(|signature| signature.family)
            .collect();
        assert_eq!(families, vec![OsFamily::Windows, OsFamily::Linux, OsFamily::Macos]);
    }

    #[test]
    fn marker_file_needs_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let signature =
            OsSignature::new(OsFamily::Windows, &[], &["bootmgr"], &[]).unwrap();
        let near_miss = vec!["bootmgr.efi".to_string()];
        assert_eq!(signature.match_tree(dir.path(), &near_miss), None);

        let exact = vec!["BOOTMGR".to_string()];
        assert_eq!(
            signature.match_tree(dir.path(), &exact),
            Some(MatchReason::MarkerFile("BOOTMGR".to_string()))
        );
    }

    #[test]
    fn invalid_pattern_is_reported() {
        assert!(matches!(
            OsSignature::new(OsFamily::Linux, &["("], &[], &[]),
            Err(MigrateError::Parse(_))
        ));
    }
}
