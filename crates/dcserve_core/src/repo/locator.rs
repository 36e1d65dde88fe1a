use crate::model::resource::ResourceId;
use std::path::{Path, PathBuf};

/// Suffix appended to a raw upload path to name its condensed companion.
pub const CONDENSED_SUFFIX: &str = "_condensed.rtdc";

/// Maps resource ids onto the local block-storage layout.
///
/// Raw uploads live at `<storage>/resources/<abc>/<def>/<rest>`; a
/// locally condensed companion sits next to it with `_condensed.rtdc`
/// appended.
#[derive(Debug, Clone)]
pub struct ResourceLocator {
    storage_path: PathBuf,
}

impl ResourceLocator {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn resource_path(&self, resource_id: &ResourceId) -> PathBuf {
        let (first, second, rest) = resource_id.shards();
        self.storage_path
            .join("resources")
            .join(first)
            .join(second)
            .join(rest)
    }

    pub fn condensed_companion_path(&self, resource_id: &ResourceId) -> PathBuf {
        let mut path = self.resource_path(resource_id).into_os_string();
        path.push(CONDENSED_SUFFIX);
        PathBuf::from(path)
    }

    /// Returns whether the raw upload is present on local storage.
    pub fn has_local_resource(&self, resource_id: &ResourceId) -> bool {
        self.resource_path(resource_id).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::ResourceLocator;
    use crate::model::resource::ResourceId;
    use std::path::Path;

    #[test]
    fn paths_follow_sharded_layout() {
        let locator = ResourceLocator::new("/data/ckan");
        let resource_id =
            ResourceId::parse("fb719fb2-bd9f-817a-7d70-f4002af916f0").expect("resource id");
        assert_eq!(
            locator.resource_path(&resource_id),
            Path::new("/data/ckan/resources/fb7/19f/b2-bd9f-817a-7d70-f4002af916f0")
        );
        assert_eq!(
            locator.condensed_companion_path(&resource_id),
            Path::new("/data/ckan/resources/fb7/19f/b2-bd9f-817a-7d70-f4002af916f0_condensed.rtdc")
        );
    }
}
