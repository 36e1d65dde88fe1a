use super::{LockError, LockGuard, LockResult, ResourceLock};
use crate::model::resource::ResourceId;
use log::{debug, info, warn};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Lock backed by marker files below a shared directory.
///
/// The marker for `abcdef...` lives at `<root>/abc/def/<rest>.lock` and
/// holds the locker id. Creation uses `create_new`, so exactly one caller
/// across all processes sharing `root` wins.
#[derive(Debug, Clone)]
pub struct FileResourceLock {
    root: PathBuf,
}

impl FileResourceLock {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Marker path for `resource_id`.
    pub fn marker_path(&self, resource_id: &ResourceId) -> PathBuf {
        let (first, second, rest) = resource_id.shards();
        self.root
            .join(first)
            .join(second)
            .join(format!("{rest}.lock"))
    }
}

impl ResourceLock for FileResourceLock {
    fn try_acquire(
        &self,
        resource_id: &ResourceId,
        locker_id: &str,
    ) -> LockResult<Option<LockGuard>> {
        let path = self.marker_path(resource_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                info!(
                    "event=lock_acquire module=lock status=skip reason=busy resource_id={} locker_id={}",
                    resource_id, locker_id
                );
                return Ok(None);
            }
            Err(source) => return Err(LockError::Io { path, source }),
        };

        if let Err(source) = file.write_all(locker_id.as_bytes()) {
            drop(file);
            remove_marker(&path);
            return Err(LockError::Io { path, source });
        }

        debug!(
            "event=lock_acquire module=lock status=ok resource_id={} locker_id={}",
            resource_id, locker_id
        );
        let marker = path.clone();
        Ok(Some(LockGuard::new(
            resource_id.clone(),
            locker_id,
            move || remove_marker(&marker),
        )))
    }
}

fn remove_marker(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(
            "event=lock_release module=lock status=ok path={}",
            path.display()
        ),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            "event=lock_release module=lock status=error path={} error={}",
            path.display(),
            err
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::FileResourceLock;
    use crate::lock::ResourceLock;
    use crate::model::resource::ResourceId;
    use std::fs;

    #[test]
    fn marker_holds_locker_id_and_is_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileResourceLock::new(dir.path());
        let resource_id = ResourceId::generate();

        let guard = lock
            .try_acquire(&resource_id, "worker-a")
            .expect("acquire")
            .expect("free lock");
        let marker = lock.marker_path(&resource_id);
        assert_eq!(fs::read_to_string(&marker).expect("marker"), "worker-a");
        assert_eq!(guard.locker_id(), "worker-a");

        drop(guard);
        assert!(!marker.exists());
    }

    #[test]
    fn second_caller_skips_instead_of_waiting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileResourceLock::new(dir.path());
        let resource_id = ResourceId::generate();

        let _held = lock
            .try_acquire(&resource_id, "worker-a")
            .expect("acquire")
            .expect("free lock");
        let second = lock.try_acquire(&resource_id, "worker-b").expect("no io error");
        assert!(second.is_none());
        // A busy attempt must not touch the holder's marker.
        assert_eq!(
            fs::read_to_string(lock.marker_path(&resource_id)).expect("marker"),
            "worker-a"
        );
    }

    #[test]
    fn release_tolerates_externally_removed_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileResourceLock::new(dir.path());
        let resource_id = ResourceId::generate();

        let guard = lock
            .try_acquire(&resource_id, "worker-a")
            .expect("acquire")
            .expect("free lock");
        fs::remove_file(lock.marker_path(&resource_id)).expect("remove");
        drop(guard);

        assert!(lock
            .try_acquire(&resource_id, "worker-b")
            .expect("acquire")
            .is_some());
    }
}
