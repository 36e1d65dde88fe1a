//! Advisory skip-if-busy locks scoped to a resource id.
//!
//! # Responsibility
//! - Define the `ResourceLock` capability used to serialize condensation.
//! - Provide a filesystem marker implementation for multi-process
//!   deployments and an in-memory one for single-process use.
//!
//! # Invariants
//! - At most one live `LockGuard` exists per resource id per lock backend.
//! - `try_acquire` never waits: a busy resource yields `Ok(None)`.
//! - A guard releases only what it acquired, exactly once, on drop.

use crate::model::resource::ResourceId;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::path::PathBuf;

mod file_lock;
mod memory_lock;

pub use file_lock::FileResourceLock;
pub use memory_lock::MemoryResourceLock;

pub type LockResult<T> = Result<T, LockError>;

/// Lock backend failures. Contention is not an error.
#[derive(Debug)]
pub enum LockError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Display for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "lock marker i/o error at `{}`: {source}", path.display())
            }
        }
    }
}

impl Error for LockError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
        }
    }
}

/// Try-acquire capability over resource ids.
pub trait ResourceLock: Send + Sync {
    /// Attempts to take the lock for `resource_id` on behalf of `locker_id`.
    ///
    /// # Errors
    /// - `LockError::Io` when the backend cannot record the acquisition.
    fn try_acquire(&self, resource_id: &ResourceId, locker_id: &str)
        -> LockResult<Option<LockGuard>>;
}

/// Held lock; released on drop.
pub struct LockGuard {
    resource_id: ResourceId,
    locker_id: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub(crate) fn new(
        resource_id: ResourceId,
        locker_id: impl Into<String>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            resource_id,
            locker_id: locker_id.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn locker_id(&self) -> &str {
        &self.locker_id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Debug for LockGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource_id", &self.resource_id)
            .field("locker_id", &self.locker_id)
            .finish()
    }
}
