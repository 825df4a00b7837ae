//! Migration Orchestrator: the staged, fail-fast OS replacement pipeline driven
//! against one [`PlatformBackend`].
//!
//! Stages run strictly in order (validate, backup, mount, partition, install,
//! bootloader). The first failing stage ends the run with that stage's fixed
//! message; completed stages are not rolled back. Whatever the outcome, the
//! orchestrator returns to idle with progress 0 once the run is over.

use osmigrate_bootloader_core::{detect_efi_loaders, EfiLoader};
use osmigrate_core::{
    BackupRecord, EngineConfig, MigrateError, MigrationRequest, MigrationStage, MigrationState,
    PlatformBackend, Result,
};
use osmigrate_identify::{Classifier, OsInfo};
use osmigrate_imaging::{validate_image, ImageValidation};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

mod observer;
mod run;

pub use observer::{stage_label, ProgressObserver, SilentObserver};
pub use run::MigrationRun;

use run::RunTicket;

pub const SUCCESS_MESSAGE: &str = "OS switch completed successfully";

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: MigrationStage,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationSuccess {
    pub run_id: Uuid,
    pub message: String,
    pub backup: Option<BackupRecord>,
    pub stages: Vec<StageReport>,
}

/// A run that stopped early. `message` is the fixed text for `stage`; `cause`
/// keeps the underlying error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct MigrationFailure {
    pub run_id: Option<Uuid>,
    pub stage: MigrationStage,
    pub message: String,
    #[source]
    pub cause: MigrateError,
}

impl MigrationFailure {
    fn rejected(cause: MigrateError) -> Self {
        Self {
            run_id: None,
            stage: MigrationStage::Idle,
            message: cause.to_string(),
            cause,
        }
    }
}

pub type MigrationResult = std::result::Result<MigrationSuccess, MigrationFailure>;

/// What `prepare_target_os` learned about an image without installing it.
#[derive(Debug, Clone, Serialize)]
pub struct TargetPreparation {
    pub image: PathBuf,
    pub validation: ImageValidation,
    pub os: OsInfo,
    pub efi_loaders: Vec<EfiLoader>,
}

#[derive(Clone)]
pub struct MigrationOrchestrator {
    backend: Arc<dyn PlatformBackend>,
    config: EngineConfig,
    state: Arc<RwLock<MigrationState>>,
    active: Arc<AtomicBool>,
}

impl MigrationOrchestrator {
    pub fn new(backend: Arc<dyn PlatformBackend>, config: EngineConfig) -> Self {
        Self {
            backend,
            config,
            state: Arc::new(RwLock::new(MigrationState::idle())),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn backend(&self) -> &dyn PlatformBackend {
        self.backend.as_ref()
    }

    pub fn status(&self) -> MigrationState {
        read_state(&self.state)
    }

    pub fn execute_migration(&self, request: &MigrationRequest) -> MigrationResult {
        self.execute_with_observer(request, &SilentObserver)
    }

    /// Runs the pipeline on the calling thread. Fails with `Busy` while another run
    /// of this orchestrator is active.
    pub fn execute_with_observer(
        &self,
        request: &MigrationRequest,
        observer: &dyn ProgressObserver,
    ) -> MigrationResult {
        let ticket = self.try_begin().map_err(MigrationFailure::rejected)?;
        let cancel = AtomicBool::new(false);
        self.run_with_ticket(ticket, request, observer, &cancel)
    }

    /// Runs the pipeline on a worker thread and hands back a handle for polling,
    /// cancellation and the final result.
    pub fn start(
        &self,
        request: MigrationRequest,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<MigrationRun> {
        let ticket = self.try_begin()?;
        let run_id = ticket.run_id();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = self.clone();
        let worker_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("osmigrate-run-{}", run_id))
            .spawn(move || {
                worker.run_with_ticket(ticket, &request, observer.as_ref(), &worker_cancel)
            })?;
        Ok(MigrationRun::new(run_id, self.state.clone(), cancel, handle))
    }

    /// Validates and classifies an image by mounting it briefly; nothing is written.
    pub fn prepare_target_os(&self, image: &Path) -> Result<TargetPreparation> {
        let validation = validate_image(image)?;
        let classifier = Classifier::builtin()?;
        let mount_point = self.backend.mount_image(image)?;
        let mount = MountGuard::new(self.backend.as_ref(), image);
        let os = classifier.classify(&mount_point)?;
        let efi_loaders = detect_efi_loaders(&mount_point);
        mount.release();
        info!(
            image = %image.display(),
            family = os.family.as_str(),
            version = %os.version,
            "target image identified"
        );
        Ok(TargetPreparation {
            image: image.to_path_buf(),
            validation,
            os,
            efi_loaders,
        })
    }

    fn try_begin(&self) -> Result<RunTicket> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("migration rejected: another run is active");
            return Err(MigrateError::Busy);
        }
        let run_id = Uuid::new_v4();
        write_state(&self.state, |state| {
            *state = MigrationState {
                run_id: Some(run_id),
                stage: MigrationStage::Validate,
                progress_percent: 0,
                last_error: None,
            };
        });
        Ok(RunTicket::new(run_id, self.state.clone(), self.active.clone()))
    }

    fn run_with_ticket(
        &self,
        mut ticket: RunTicket,
        request: &MigrationRequest,
        observer: &dyn ProgressObserver,
        cancel: &AtomicBool,
    ) -> MigrationResult {
        let run_id = ticket.run_id();
        info!(
            %run_id,
            image = %request.image_path.display(),
            target = %request.target_partition,
            preserve_data = request.preserve_data,
            "migration started"
        );
        let pipeline = Pipeline {
            backend: self.backend.as_ref(),
            state: &self.state,
            observer,
            cancel,
            run_id,
            stages: Vec::new(),
        };
        let result = pipeline.run(request, &self.config.backup_dir);
        match &result {
            Ok(_) => info!(%run_id, "migration completed"),
            Err(failure) => error!(%run_id, stage = failure.stage.as_str(), cause = %failure.cause, "migration failed"),
        }
        ticket.finish(result.as_ref().err().map(|failure| failure.message.clone()));
        result
    }
}

struct Pipeline<'a> {
    backend: &'a dyn PlatformBackend,
    state: &'a RwLock<MigrationState>,
    observer: &'a dyn ProgressObserver,
    cancel: &'a AtomicBool,
    run_id: Uuid,
    stages: Vec<StageReport>,
}

impl<'a> Pipeline<'a> {
    fn run(mut self, request: &MigrationRequest, backup_dir: &Path) -> MigrationResult {
        let image = request.image_path.as_path();
        let target = request.target_partition.as_str();

        self.enter(MigrationStage::Validate)?;
        self.step(MigrationStage::Validate, |backend| {
            validate_image(image)?;
            backend.validate_partition(target)
        })?;

        self.enter(MigrationStage::Backup)?;
        let backup = if request.preserve_data {
            let record = self.step(MigrationStage::Backup, |backend| backend.create_archive(backup_dir))?;
            info!(run_id = %self.run_id, backup_id = %record.id, "system backup written");
            Some(record)
        } else {
            None
        };

        self.enter(MigrationStage::Mount)?;
        let mount_point = self.step(MigrationStage::Mount, |backend| backend.mount_image(image))?;
        let mount = MountGuard::new(self.backend, image);

        self.enter(MigrationStage::Partition)?;
        self.step(MigrationStage::Partition, |backend| backend.prepare_partition(target))?;

        self.enter(MigrationStage::Install)?;
        self.step(MigrationStage::Install, |backend| {
            backend.install_from_mount(&mount_point, target)
        })?;
        mount.release();

        self.enter(MigrationStage::Bootloader)?;
        self.step(MigrationStage::Bootloader, |backend| backend.configure_bootloader(target))?;

        write_state(self.state, |state| {
            state.stage = MigrationStage::Complete;
            state.progress_percent = MigrationStage::Complete.progress();
        });
        self.observer.on_progress(
            MigrationStage::Complete,
            MigrationStage::Complete.progress(),
            SUCCESS_MESSAGE,
        );
        Ok(MigrationSuccess {
            run_id: self.run_id,
            message: SUCCESS_MESSAGE.to_string(),
            backup,
            stages: self.stages,
        })
    }

    /// Publishes the stage and gives the observer and the run handle a chance to cancel.
    fn enter(&self, stage: MigrationStage) -> std::result::Result<(), MigrationFailure> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(self.failure(stage, MigrateError::Cancelled));
        }
        let progress = stage.progress();
        write_state(self.state, |state| {
            state.stage = stage;
            state.progress_percent = progress;
        });
        info!(run_id = %self.run_id, stage = stage.as_str(), progress, "stage started");
        if !self.observer.on_progress(stage, progress, stage_label(stage)) {
            self.cancel.store(true, Ordering::SeqCst);
            return Err(self.failure(stage, MigrateError::Cancelled));
        }
        Ok(())
    }

    fn step<T>(
        &mut self,
        stage: MigrationStage,
        operation: impl FnOnce(&dyn PlatformBackend) -> Result<T>,
    ) -> std::result::Result<T, MigrationFailure> {
        let started = Instant::now();
        match operation(self.backend) {
            Ok(value) => {
                self.stages.push(StageReport {
                    stage,
                    duration_ms: started.elapsed().as_millis(),
                });
                Ok(value)
            }
            Err(cause) => {
                error!(run_id = %self.run_id, stage = stage.as_str(), %cause, "stage failed");
                Err(self.failure(stage, cause))
            }
        }
    }

    fn failure(&self, stage: MigrationStage, cause: MigrateError) -> MigrationFailure {
        let message = match &cause {
            MigrateError::Cancelled => cause.to_string(),
            _ => stage.failure_message().to_string(),
        };
        MigrationFailure {
            run_id: Some(self.run_id),
            stage,
            message,
            cause,
        }
    }
}

/// Unmounts the image when dropped unless already released.
struct MountGuard<'a> {
    backend: &'a dyn PlatformBackend,
    image: &'a Path,
    mounted: bool,
}

impl<'a> MountGuard<'a> {
    fn new(backend: &'a dyn PlatformBackend, image: &'a Path) -> Self {
        Self {
            backend,
            image,
            mounted: true,
        }
    }

    fn release(mut self) {
        self.unmount();
    }

    fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        if let Err(error) = self.backend.unmount_image(self.image) {
            warn!(image = %self.image.display(), %error, "failed to unmount image");
        }
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        self.unmount();
    }
}

pub(crate) fn read_state(state: &RwLock<MigrationState>) -> MigrationState {
    state.read().unwrap_or_else(PoisonError::into_inner).clone()
}

pub(crate) fn write_state(state: &RwLock<MigrationState>, update: impl FnOnce(&mut MigrationState)) {
    let mut guard = state.write().unwrap_or_else(PoisonError::into_inner);
    update(&mut *guard);
}
