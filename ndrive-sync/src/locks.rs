//! Locks shared by the processors of one engine.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use ndrive_client::names::is_under;
use ndrive_client::LocalClient;

use crate::errors::{Result, SyncError};

/// Local paths currently handled by a processor, compared case-insensitively.
#[derive(Debug, Default)]
pub struct PathLocks {
    paths: Mutex<HashSet<String>>,
}

impl PathLocks {
    /// Claim `path`; a path already claimed interrupts the pair.
    pub fn lock(&self, path: &str) -> Result<PathLockGuard<'_>> {
        let key = path.to_lowercase();
        debug!("Soft locking {:?}", key);
        if !self.paths.lock().insert(key.clone()) {
            return Err(SyncError::PairInterrupt);
        }
        Ok(PathLockGuard { locks: self, key })
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.paths.lock().contains(&path.to_lowercase())
    }
}

pub struct PathLockGuard<'a> {
    locks: &'a PathLocks,
    key: String,
}

impl Drop for PathLockGuard<'_> {
    fn drop(&mut self) {
        debug!("Soft unlocking {:?}", self.key);
        self.locks.paths.lock().remove(&self.key);
    }
}

/// Readonly folders temporarily made writable, with their holder count and
/// the flags to restore once the last holder is done.
#[derive(Debug, Default)]
pub struct ReadonlyLocks {
    folders: Mutex<HashMap<String, (u32, u8)>>,
}

impl ReadonlyLocks {
    pub fn unlock(&self, local: &LocalClient, path: &str) -> Result<()> {
        let mut folders = self.folders.lock();
        if let Some(entry) = folders.get_mut(path) {
            debug!("Readonly unlock: increase count on {:?}", path);
            entry.0 += 1;
            return Ok(());
        }
        let locker = local.unlock_ref(path, false)?;
        debug!("Readonly unlock: unlock on {:?} with {}", path, locker);
        folders.insert(path.to_string(), (1, locker));
        Ok(())
    }

    pub fn lock(&self, local: &LocalClient, path: &str) -> Result<()> {
        let mut folders = self.folders.lock();
        let Some(entry) = folders.get_mut(path) else {
            info!("Readonly lock: cannot find reference on {:?}", path);
            return Ok(());
        };
        entry.0 -= 1;
        if entry.0 > 0 {
            debug!("Readonly lock: update lock count on {:?} to {}", path, entry.0);
            return Ok(());
        }
        let locker = entry.1;
        folders.remove(path);
        local.lock_ref(path, locker)?;
        debug!("Readonly lock: relocked {:?} with {}", path, locker);
        Ok(())
    }

    pub fn holders(&self, path: &str) -> u32 {
        self.folders.lock().get(path).map_or(0, |e| e.0)
    }
}

/// A local folder being moved or deleted by one processor; the others keep
/// away from its content until it is released.
#[derive(Debug, Default)]
pub struct FolderLock {
    current: Mutex<Option<(String, usize)>>,
}

impl FolderLock {
    pub fn set(&self, path: &str, holder: usize) {
        info!("Local folder locking on {:?}", path);
        *self.current.lock() = Some((path.to_string(), holder));
    }

    pub fn release(&self) {
        if self.current.lock().take().is_some() {
            info!("Local folder unlocking");
        }
    }

    pub fn current(&self) -> Option<String> {
        self.current.lock().as_ref().map(|(p, _)| p.clone())
    }

    /// Whether `worker` must stay away from `path`.
    pub fn blocks(&self, path: &str, worker: usize) -> bool {
        match self.current.lock().as_ref() {
            Some((locked, holder)) => *holder != worker && is_under(path, locked) && path != locked,
            None => false,
        }
    }
}
