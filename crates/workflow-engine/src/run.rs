use crate::{read_state, write_state, MigrationFailure, MigrationResult};
use osmigrate_core::{MigrateError, MigrationStage, MigrationState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use uuid::Uuid;

/// Exclusive right to run the pipeline. Dropping it returns the orchestrator to idle
/// with progress 0, keeping the failure message of the run if there was one.
pub(crate) struct RunTicket {
    run_id: Uuid,
    state: Arc<RwLock<MigrationState>>,
    active: Arc<AtomicBool>,
    last_error: Option<String>,
}

impl RunTicket {
    pub(crate) fn new(run_id: Uuid, state: Arc<RwLock<MigrationState>>, active: Arc<AtomicBool>) -> Self {
        Self {
            run_id,
            state,
            active,
            last_error: None,
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) fn finish(&mut self, last_error: Option<String>) {
        self.last_error = last_error;
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        let last_error = self.last_error.take();
        write_state(&self.state, |state| {
            *state = MigrationState {
                last_error,
                ..MigrationState::idle()
            };
        });
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Handle to a migration running on a worker thread.
pub struct MigrationRun {
    run_id: Uuid,
    state: Arc<RwLock<MigrationState>>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<MigrationResult>,
}

impl MigrationRun {
    pub(crate) fn new(
        run_id: Uuid,
        state: Arc<RwLock<MigrationState>>,
        cancel: Arc<AtomicBool>,
        handle: JoinHandle<MigrationResult>,
    ) -> Self {
        Self {
            run_id,
            state,
            cancel,
            handle,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> MigrationState {
        read_state(&self.state)
    }

    /// Stops the run before its next stage. A stage already running is not interrupted.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> MigrationResult {
        let run_id = self.run_id;
        self.handle.join().unwrap_or_else(|_| {
            Err(MigrationFailure {
                run_id: Some(run_id),
                stage: MigrationStage::Idle,
                message: "Migration worker panicked".to_string(),
                cause: MigrateError::Io(std::io::Error::other("migration worker panicked")),
            })
        })
    }
}
