//! Boot Configuration Data entries managed through `bcdedit`.

use crate::partition::parse_drive_letter;
use osmigrate_bootloader_core::bcd::{
    parse_created_identifier, parse_enum, validate_identifier, BOOT_MANAGER,
};
use osmigrate_bootloader_core::validate_entry_title;
use osmigrate_core::{
    run_sequence, BootEntry, BootloaderDriver, MigrateError, Result, StageOutcome, ToolCommand,
    ToolRunner,
};
use std::sync::Arc;
use tracing::info;

const WINLOAD_PATH: &str = "\\Windows\\system32\\winload.efi";
const SYSTEM_ROOT: &str = "\\Windows";
const BOOT_MENU_TIMEOUT_SECS: &str = "10";

/// Aliases that always resolve to a live entry and must not be deleted.
const PROTECTED_IDENTIFIERS: [&str; 3] = [BOOT_MANAGER, "{current}", "{default}"];

fn bcdedit<I, S>(args: I) -> ToolCommand
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ToolCommand::new("bcdedit").args(args)
}

pub struct BcdDriver {
    runner: Arc<dyn ToolRunner>,
    title: String,
}

impl BcdDriver {
    pub fn new(runner: Arc<dyn ToolRunner>, title: String) -> Self {
        Self { runner, title }
    }
}

impl BootloaderDriver for BcdDriver {
    fn configure(&self, partition_id: &str) -> Result<StageOutcome> {
        let letter = parse_drive_letter(partition_id)?;
        validate_entry_title(&self.title)?;
        let device = format!("partition={}:", letter);

        let created = self.runner.run(&bcdedit([
            "/create",
            "/d",
            self.title.as_str(),
            "/application",
            "osloader",
        ]))?;
        let guid = parse_created_identifier(&created.stdout).ok_or_else(|| {
            MigrateError::Parse("bcdedit did not report the new entry identifier".to_string())
        })?;

        let guid = guid.as_str();
        run_sequence(
            self.runner.as_ref(),
            &[
                bcdedit(["/set", guid, "device", device.as_str()]),
                bcdedit(["/set", guid, "osdevice", device.as_str()]),
                bcdedit(["/set", guid, "path", WINLOAD_PATH]),
                bcdedit(["/set", guid, "systemroot", SYSTEM_ROOT]),
                bcdedit(["/displayorder", guid, "/addlast"]),
                bcdedit(["/set", BOOT_MANAGER, "timeout", BOOT_MENU_TIMEOUT_SECS]),
            ],
        )?;
        info!(entry = guid, partition = %device, "BCD entry created");
        Ok(StageOutcome::new(format!(
            "Boot entry '{}' {} added for {}:",
            self.title, guid, letter
        )))
    }

    fn list_entries(&self) -> Result<Vec<BootEntry>> {
        let output = self.runner.run(&bcdedit(["/enum"]))?;
        Ok(parse_enum(&output.stdout))
    }

    fn set_default(&self, entry: &str) -> Result<StageOutcome> {
        validate_identifier(entry)?;
        self.runner.run(&bcdedit(["/default", entry]))?;
        Ok(StageOutcome::new(format!("Default boot entry set to {}", entry)))
    }

    fn remove_entry(&self, entry: &str) -> Result<StageOutcome> {
        validate_identifier(entry)?;
        if PROTECTED_IDENTIFIERS
            .iter()
            .any(|protected| protected.eq_ignore_ascii_case(entry))
        {
            return Err(MigrateError::validation(format!("refusing to delete {}", entry)));
        }
        let known = self
            .list_entries()?
            .iter()
            .any(|candidate| candidate.identifier.eq_ignore_ascii_case(entry));
        if !known {
            return Err(MigrateError::not_found(format!("Boot entry {} not found", entry)));
        }
        self.runner.run(&bcdedit(["/delete", entry]))?;
        info!(entry, "BCD entry removed");
        Ok(StageOutcome::new(format!("Boot entry {} removed", entry)))
    }
}
