//! Mount Table: image path to mount point, one entry per mounted image.

use crate::error::{MigrateError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;

#[derive(Debug)]
pub struct MountTable {
    root: TempDir,
    next_id: AtomicUsize,
    entries: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl MountTable {
    /// Creates a fresh mount-point root under `parent` (or the system temp dir).
    pub fn new(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("osmigrate_mounts_");
        let root = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self {
            root,
            next_id: AtomicUsize::new(0),
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Allocates and creates a mount-point directory that no other entry uses.
    pub fn allocate(&self) -> Result<PathBuf> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mount_point = self.root.path().join(format!("mount_{}", id));
        std::fs::create_dir_all(&mount_point)?;
        Ok(mount_point)
    }

    pub fn insert(&self, image: &Path, mount_point: PathBuf) -> Result<()> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(image) {
            return Err(MigrateError::Mount(format!(
                "{} is already mounted at {}",
                image.display(),
                existing.display()
            )));
        }
        entries.insert(image.to_path_buf(), mount_point);
        Ok(())
    }

    pub fn get(&self, image: &Path) -> Option<PathBuf> {
        self.lock().get(image).cloned()
    }

    pub fn contains(&self, image: &Path) -> bool {
        self.lock().contains_key(image)
    }

    pub fn remove(&self, image: &Path) -> Option<PathBuf> {
        self.lock().remove(image)
    }

    pub fn snapshot(&self) -> Vec<(PathBuf, PathBuf)> {
        let mut entries: Vec<(PathBuf, PathBuf)> = self
            .lock()
            .iter()
            .map(|(image, mount)| (image.clone(), mount.clone()))
            .collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, PathBuf>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deletes a mount-point directory tree; a directory that is already gone is fine.
pub fn release_mount_point(mount_point: &Path) -> Result<()> {
    match std::fs::remove_dir_all(mount_point) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}
