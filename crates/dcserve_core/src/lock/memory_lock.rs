use super::{LockGuard, LockResult, ResourceLock};
use crate::model::resource::ResourceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Process-local lock table.
#[derive(Debug, Clone, Default)]
pub struct MemoryResourceLock {
    holders: Arc<Mutex<HashMap<ResourceId, String>>>,
}

impl MemoryResourceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `resource_id`, if any.
    pub fn holder(&self, resource_id: &ResourceId) -> Option<String> {
        self.holders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id)
            .cloned()
    }
}

impl ResourceLock for MemoryResourceLock {
    fn try_acquire(
        &self,
        resource_id: &ResourceId,
        locker_id: &str,
    ) -> LockResult<Option<LockGuard>> {
        let mut holders = self.holders.lock().unwrap_or_else(PoisonError::into_inner);
        if holders.contains_key(resource_id) {
            return Ok(None);
        }
        holders.insert(resource_id.clone(), locker_id.to_string());

        let table = Arc::clone(&self.holders);
        let key = resource_id.clone();
        Ok(Some(LockGuard::new(resource_id.clone(), locker_id, move || {
            table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        })))
    }
}
