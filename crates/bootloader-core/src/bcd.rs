//! Parsing of `bcdedit` output and validation of BCD identifiers.

use osmigrate_core::{BootEntry, MigrateError, Result};
use regex::Regex;
use std::collections::HashMap;

pub const BOOT_MANAGER: &str = "{bootmgr}";

const GUID_PATTERN: &str =
    r"\{[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\}";

/// Identifier of the entry reported by `bcdedit /create`.
pub fn parse_created_identifier(stdout: &str) -> Option<String> {
    let pattern = Regex::new(GUID_PATTERN).ok()?;
    pattern.find(stdout).map(|found| found.as_str().to_string())
}

/// Accepts a GUID in braces or a well-known alias such as `{current}`.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let valid = identifier.len() > 2
        && identifier.starts_with('{')
        && identifier.ends_with('}')
        && identifier[1..identifier.len() - 1]
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-');
    if valid {
        Ok(())
    } else {
        Err(MigrateError::validation(format!("invalid boot entry identifier: {}", identifier)))
    }
}

/// Loader entries from `bcdedit /enum` text output. The boot manager block names
/// the default entry; it is not itself returned.
pub fn parse_enum(stdout: &str) -> Vec<BootEntry> {
    let blocks = parse_blocks(stdout);
    let default = blocks
        .iter()
        .find(|block| block.get("identifier").map(String::as_str) == Some(BOOT_MANAGER))
        .and_then(|block| block.get("default").cloned());

    blocks
        .iter()
        .filter_map(|block| {
            let identifier = block.get("identifier")?;
            if identifier == BOOT_MANAGER {
                return None;
            }
            let description = block.get("description")?;
            Some(BootEntry {
                identifier: identifier.clone(),
                description: description.clone(),
                is_default: default.as_deref() == Some(identifier.as_str()),
            })
        })
        .collect()
}

fn parse_blocks(stdout: &str) -> Vec<HashMap<String, String>> {
    let mut blocks = Vec::new();
    let mut current: HashMap<String, String> = HashMap::new();
    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        // Continuation lines (multi-valued settings) start with whitespace.
        if line.starts_with(char::is_whitespace) || trimmed.starts_with('-') {
            continue;
        }
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let key = parts.next().unwrap_or_default().to_ascii_lowercase();
        let value = parts.next().unwrap_or_default().trim();
        if value.is_empty() {
            continue;
        }
        current.entry(key).or_insert_with(|| value.to_string());
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENUM_OUTPUT: &str = "\
Windows Boot Manager
--------------------
identifier              {bootmgr}
device                  partition=\\Device\\HarddiskVolume1
description             Windows Boot Manager
default                 {current}
displayorder            {current}
                        {6d1c2a2e-8f4b-11ee-9c1a-0242ac120002}
timeout                 30

Windows Boot Loader
-------------------
identifier              {current}
device                  partition=C:
path                    \\WINDOWS\\system32\\winload.efi
description             Windows 11

Windows Boot Loader
-------------------
identifier              {6d1c2a2e-8f4b-11ee-9c1a-0242ac120002}
device                  partition=D:
description             Migrated OS
";

    #[test]
    fn enum_lists_loaders_and_default() {
        let entries = parse_enum(ENUM_OUTPUT);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identifier, "{current}");
        assert_eq!(entries[0].description, "Windows 11");
        assert!(entries[0].is_default);
        assert_eq!(entries[1].description, "Migrated OS");
        assert!(!entries[1].is_default);
    }

    #[test]
    fn create_output_yields_guid() {
        let stdout = "The entry {6d1c2a2e-8f4b-11ee-9c1a-0242ac120002} was successfully created.\r\n";
        assert_eq!(
            parse_created_identifier(stdout).as_deref(),
            Some("{6d1c2a2e-8f4b-11ee-9c1a-0242ac120002}")
        );
        assert_eq!(parse_created_identifier("Access is denied."), None);
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("{current}").is_ok());
        assert!(validate_identifier("{6d1c2a2e-8f4b-11ee-9c1a-0242ac120002}").is_ok());
        assert!(validate_identifier("{}").is_err());
        assert!(validate_identifier("{a} /delete").is_err());
        assert!(validate_identifier("current").is_err());
    }
}
