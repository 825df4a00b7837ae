use osmigrate_core::MigrationStage;

/// Receives progress as each stage starts. Returning `false` asks the run to stop
/// before its next stage.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, stage: MigrationStage, percent: u8, message: &str) -> bool;
}

impl<F> ProgressObserver for F
where
    F: Fn(MigrationStage, u8, &str) -> bool + Send + Sync,
{
    fn on_progress(&self, stage: MigrationStage, percent: u8, message: &str) -> bool {
        self(stage, percent, message)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SilentObserver;

impl ProgressObserver for SilentObserver {
    fn on_progress(&self, _stage: MigrationStage, _percent: u8, _message: &str) -> bool {
        true
    }
}

pub fn stage_label(stage: MigrationStage) -> &'static str {
    match stage {
        MigrationStage::Idle => "Idle",
        MigrationStage::Validate => "Validating image and target partition",
        MigrationStage::Backup => "Backing up current system",
        MigrationStage::Mount => "Mounting image",
        MigrationStage::Partition => "Preparing target partition",
        MigrationStage::Install => "Installing operating system",
        MigrationStage::Bootloader => "Configuring bootloader",
        MigrationStage::Complete => "Complete",
    }
}
