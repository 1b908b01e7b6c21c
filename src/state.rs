//! ==============================================================================
//! state.rs - provisioning state primitives
//! ==============================================================================
//!
//! purpose:
//!     the two pieces of shared mutable state the provisioner needs:
//!     - PropertyStore: durable scalar get/set (holds the last provisioned date)
//!     - AdvisoryLock: try-acquire with a bounded wait, release on drop
//!
//! relationships:
//!     - used by: provision.rs
//!     - wired in: server.rs (memory vs. json-file properties)
//!
//! ==============================================================================

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::error::StoreError;

// ==============================================================================
// property store
// ==============================================================================

pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryProperties {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryProperties {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PropertyStore for MemoryProperties {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// properties kept as a flat json object in one file.
/// reads go to disk every time so a restart picks up where it left off.
pub struct JsonFileProperties {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileProperties {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<HashMap<String, String>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                StoreError::CorruptProperties {
                    path: self.path.clone(),
                    source,
                }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}

impl PropertyStore for JsonFileProperties {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());

        let bytes = serde_json::to_vec_pretty(&values).map_err(|source| {
            StoreError::CorruptProperties {
                path: self.path.clone(),
                source,
            }
        })?;

        // uniquely named temp file beside the target, then rename over it:
        // readers only ever see a whole file
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;

        let mut file = temp.as_file();
        file.write_all(&bytes)
            .map_err(|e| StoreError::io(temp.path(), e))?;
        file.sync_all()
            .map_err(|e| StoreError::io(temp.path(), e))?;

        temp.persist(&self.path)
            .map_err(|e| StoreError::io(&self.path, e.error))?;
        Ok(())
    }
}

// ==============================================================================
// advisory lock
// ==============================================================================

pub trait AdvisoryLock: Send + Sync {
    /// wait up to `wait` for the lock; true if it is now held by the caller
    fn try_acquire(&self, wait: Duration) -> bool;
    fn release(&self);
}

/// scoped hold on an AdvisoryLock; released when dropped, on every path
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a dyn AdvisoryLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// acquire `lock` within `wait`, or None on timeout
pub fn lock_with_timeout(lock: &dyn AdvisoryLock, wait: Duration) -> Option<LockGuard<'_>> {
    if lock.try_acquire(wait) {
        Some(LockGuard { lock })
    } else {
        None
    }
}

/// in-process lock shared by every request this server handles
#[derive(Default)]
pub struct ProcessLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl ProcessLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdvisoryLock for ProcessLock {
    fn try_acquire(&self, wait: Duration) -> bool {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut held, _) = self
            .released
            .wait_timeout_while(held, wait, |held| *held)
            .unwrap_or_else(PoisonError::into_inner);
        if *held {
            return false;
        }
        *held = true;
        true
    }

    fn release(&self) {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.released.notify_one();
    }
}
