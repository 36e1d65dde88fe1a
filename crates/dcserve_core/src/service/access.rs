/// Caller-supplied authorization hook for resource access.
pub trait AccessPolicy {
    /// Returns `Err(message)` when the caller may not read `resource_id`.
    fn check_resource_access(&self, resource_id: &str) -> Result<(), String>;
}

/// Policy granting access to every resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check_resource_access(&self, _resource_id: &str) -> Result<(), String> {
        Ok(())
    }
}

impl<F> AccessPolicy for F
where
    F: Fn(&str) -> Result<(), String>,
{
    fn check_resource_access(&self, resource_id: &str) -> Result<(), String> {
        self(resource_id)
    }
}
