//! GRUB boot entries written as `grub.d` scripts and activated with `update-grub`.

use crate::partition::check_device_path;
use osmigrate_bootloader_core::grub::{
    self, entry_script_path, menu_entry_titles, render_entry_script, CUSTOM_ENTRY_PREFIX,
};
use osmigrate_bootloader_core::validate_entry_name;
use osmigrate_core::{
    BootEntry, BootloaderDriver, MigrateError, Result, StageOutcome, ToolCommand, ToolRunner,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const ENTRY_NAME: &str = "osmigrate";

pub struct GrubDriver {
    runner: Arc<dyn ToolRunner>,
    grub_dir: PathBuf,
    default_file: PathBuf,
    title: String,
}

impl GrubDriver {
    pub fn new(runner: Arc<dyn ToolRunner>, grub_dir: PathBuf, default_file: PathBuf, title: String) -> Self {
        Self {
            runner,
            grub_dir,
            default_file,
            title,
        }
    }

    fn refresh(&self) -> Result<()> {
        self.runner.run(&ToolCommand::new("update-grub"))?;
        Ok(())
    }

    fn custom_scripts(&self) -> Result<Vec<(String, PathBuf)>> {
        if !self.grub_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut scripts = Vec::new();
        for entry in fs::read_dir(&self.grub_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(identifier) = name.strip_prefix(CUSTOM_ENTRY_PREFIX) {
                if validate_entry_name(identifier).is_ok() && entry.path().is_file() {
                    scripts.push((identifier.to_string(), entry.path()));
                }
            }
        }
        scripts.sort();
        Ok(scripts)
    }

    fn current_default(&self) -> Option<String> {
        fs::read_to_string(&self.default_file)
            .ok()
            .and_then(|contents| grub::parse_default(&contents))
    }
}

impl BootloaderDriver for GrubDriver {
    fn configure(&self, partition_id: &str) -> Result<StageOutcome> {
        check_device_path(partition_id)?;
        if !self.grub_dir.is_dir() {
            return Err(MigrateError::not_found(format!(
                "GRUB configuration directory {} not found",
                self.grub_dir.display()
            )));
        }
        let script = render_entry_script(&self.title, partition_id)?;
        let path = entry_script_path(&self.grub_dir, ENTRY_NAME)?;
        fs::write(&path, script)?;
        set_executable(&path)?;
        self.refresh()?;
        info!(entry = %path.display(), partition = partition_id, "GRUB entry installed");
        Ok(StageOutcome::new(format!(
            "Boot entry '{}' added for {}",
            self.title, partition_id
        )))
    }

    fn list_entries(&self) -> Result<Vec<BootEntry>> {
        let default = self.current_default();
        let mut entries = Vec::new();
        for (identifier, path) in self.custom_scripts()? {
            let script = fs::read_to_string(&path)?;
            for title in menu_entry_titles(&script) {
                let is_default = default.as_deref() == Some(title.as_str())
                    || default.as_deref() == Some(identifier.as_str());
                entries.push(BootEntry {
                    identifier: identifier.clone(),
                    description: title,
                    is_default,
                });
            }
        }
        Ok(entries)
    }

    fn set_default(&self, entry: &str) -> Result<StageOutcome> {
        // A custom script identifier resolves to the menu title it emits.
        let value = self
            .list_entries()?
            .into_iter()
            .find(|candidate| candidate.identifier == entry)
            .map(|candidate| candidate.description)
            .unwrap_or_else(|| entry.to_string());

        let contents = fs::read_to_string(&self.default_file).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => MigrateError::not_found(format!(
                "{} not found",
                self.default_file.display()
            )),
            _ => MigrateError::Io(error),
        })?;
        let updated = grub::set_default(&contents, &value)?;
        fs::write(&self.default_file, updated)?;
        self.refresh()?;
        Ok(StageOutcome::new(format!("Default boot entry set to '{}'", value)))
    }

    fn remove_entry(&self, entry: &str) -> Result<StageOutcome> {
        let path = entry_script_path(&self.grub_dir, entry)?;
        if !path.is_file() {
            return Err(MigrateError::not_found(format!("Boot entry {} not found", entry)));
        }
        fs::remove_file(&path)?;
        self.refresh()?;
        info!(entry, "GRUB entry removed");
        Ok(StageOutcome::new(format!("Boot entry {} removed", entry)))
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmigrate_core::testing::ScriptedRunner;

    struct Fixture {
        _dir: tempfile::TempDir,
        grub_dir: PathBuf,
        default_file: PathBuf,
        runner: Arc<ScriptedRunner>,
        driver: GrubDriver,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let grub_dir = dir.path().join("grub.d");
        fs::create_dir(&grub_dir).unwrap();
        let default_file = dir.path().join("grub");
        fs::write(&default_file, "GRUB_DEFAULT=0\nGRUB_TIMEOUT=5\n").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let driver = GrubDriver::new(
            runner.clone(),
            grub_dir.clone(),
            default_file.clone(),
            "Migrated OS".to_string(),
        );
        Fixture {
            _dir: dir,
            grub_dir,
            default_file,
            runner,
            driver,
        }
    }

    #[test]
    fn configure_writes_script_and_refreshes() {
        let fx = fixture();
        fx.driver.configure("/dev/sdb1").unwrap();

        let script_path = fx.grub_dir.join("40_osmigrate");
        let script = fs::read_to_string(&script_path).unwrap();
        assert!(script.contains("menuentry 'Migrated OS'"));
        assert!(script.contains("root=/dev/sdb1"));
        assert_eq!(fx.runner.programs(), vec!["update-grub"]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&script_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn configure_fails_when_refresh_fails() {
        let fx = fixture();
        fx.runner.fail("update-grub", None);
        assert!(matches!(
            fx.driver.configure("/dev/sdb1"),
            Err(MigrateError::ToolExecution { .. })
        ));
    }

    #[test]
    fn configure_requires_grub_dir() {
        let fx = fixture();
        fs::remove_dir(&fx.grub_dir).unwrap();
        assert!(matches!(
            fx.driver.configure("/dev/sdb1"),
            Err(MigrateError::NotFound(_))
        ));
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn default_is_set_by_identifier() {
        let fx = fixture();
        fx.driver.configure("/dev/sdb1").unwrap();
        fx.driver.set_default(ENTRY_NAME).unwrap();

        let contents = fs::read_to_string(&fx.default_file).unwrap();
        assert!(contents.contains("GRUB_DEFAULT=\"Migrated OS\""));
        assert!(contents.contains("GRUB_TIMEOUT=5"));

        let entries = fx.driver.list_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identifier, ENTRY_NAME);
        assert!(entries[0].is_default);
    }

    #[test]
    fn remove_deletes_script() {
        let fx = fixture();
        fx.driver.configure("/dev/sdb1").unwrap();
        fx.driver.remove_entry(ENTRY_NAME).unwrap();
        assert!(!fx.grub_dir.join("40_osmigrate").exists());
        assert_eq!(fx.runner.programs(), vec!["update-grub", "update-grub"]);

        assert!(matches!(
            fx.driver.remove_entry(ENTRY_NAME),
            Err(MigrateError::NotFound(_))
        ));
        assert!(fx.driver.remove_entry("../../etc/passwd").is_err());
    }
}
